//! `/report/*` routes: start, stop, resume, load, status, snapshots,
//! restore, downloads.

use crate::auth::Principal;
use crate::emitter::snapshots::{report_state_projection, SNAPSHOT_LOG_LINES};
use crate::error::{RelayError, Result};
use crate::flows::FLOW_REPORT;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use flowgraph_checkpoint::Checkpoint;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::sse::sse_response;

fn default_execution_mode() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StartReportRequest {
    pub thread_id: Option<String>,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub snapshot_id: String,
}

async fn authorize_report(state: &AppState, principal: &Principal) -> Result<String> {
    let flow_tag = state.settings.flows.report_flow_tag.clone();
    state.policy.authorize_flow_tag(&principal.email, &flow_tag)?;
    Ok(flow_tag)
}

fn parse_thread_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| RelayError::Validation(format!("invalid thread_id: {raw}")))
}

async fn require_checkpoint(state: &AppState, thread_id: &str) -> Result<Checkpoint> {
    let flow = state.flows.get(FLOW_REPORT)?;
    flow.state(thread_id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("thread {thread_id}")))
}

/// `POST /report/start`. `local` and `cloud_run_service` stream SSE
/// immediately; `cloud_run_job` hands off to the job runner and returns the
/// handle.
pub async fn start(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<StartReportRequest>,
) -> Result<Response> {
    let flow_tag = authorize_report(&state, &principal).await?;

    let thread_id = match request.thread_id.filter(|id| !id.is_empty()) {
        Some(id) => parse_thread_id(&id)?,
        None => Uuid::new_v4().to_string(),
    };

    if request.execution_mode == "cloud_run_job" {
        let handle = state
            .jobs
            .submit_report_job(&thread_id, json!({"model": request.model}))
            .await?;
        info!(thread_id, job_id = %handle.job_id, "report submitted as job");
        return Ok(Json(json!({"job_id": handle.job_id, "status": handle.status})).into_response());
    }
    if !matches!(request.execution_mode.as_str(), "local" | "cloud_run_service") {
        return Err(RelayError::Validation(format!(
            "unknown execution_mode: {}",
            request.execution_mode
        )));
    }

    state.cancel.reset(&thread_id);
    state
        .threads
        .upsert_thread(&thread_id, &principal.user_id, None, Some(&flow_tag))
        .await?;
    state.gateway.metrics().init_execution(&thread_id);

    let procedures = state.procedures.load_procedures().await?;
    info!(
        thread_id,
        user_id = %principal.user_id,
        procedures = procedures.len(),
        mode = %request.execution_mode,
        "starting report run"
    );

    let context = match &request.model {
        Some(model) => json!({"model": model}),
        None => Value::Null,
    };
    let flow = state.flows.get(FLOW_REPORT)?;
    let input = json!({"raw_procedures": procedures});
    let stream = state.start_stream(FLOW_REPORT, flow, &thread_id, Some(input), None, context);
    Ok(sse_response(stream))
}

/// `POST /report/{thread_id}/stop` - set the cancellation flag and return
/// immediately; the running analysts finish on their own.
pub async fn stop(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = parse_thread_id(&thread_id)?;
    state.cancel.cancel(&thread_id);
    info!(thread_id, "cancellation requested");
    Ok(Json(json!({"thread_id": thread_id, "status": "stopping"})))
}

/// `POST /report/{thread_id}/resume` - continue from the latest checkpoint
/// in the background.
pub async fn resume(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>> {
    authorize_report(&state, &principal).await?;
    let thread_id = parse_thread_id(&thread_id)?;
    require_checkpoint(&state, &thread_id).await?;

    state.cancel.reset(&thread_id);
    state.threads.update_last_accessed(&thread_id).await?;
    state.gateway.metrics().init_execution(&thread_id);
    spawn_background_run(&state, &thread_id, None);
    Ok(Json(json!({"thread_id": thread_id, "status": "resumed"})))
}

/// `POST /report/{thread_id}/restore` - resume from a specific checkpoint.
pub async fn restore(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(thread_id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<Value>> {
    authorize_report(&state, &principal).await?;
    let thread_id = parse_thread_id(&thread_id)?;
    let flow = state.flows.get(FLOW_REPORT)?;
    flow.state_at(&thread_id, &request.snapshot_id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("snapshot {}", request.snapshot_id)))?;

    state.cancel.reset(&thread_id);
    state.threads.update_last_accessed(&thread_id).await?;
    spawn_background_run(&state, &thread_id, Some(request.snapshot_id.clone()));
    Ok(Json(json!({
        "thread_id": thread_id,
        "snapshot_id": request.snapshot_id,
        "status": "restored",
    })))
}

fn spawn_background_run(state: &AppState, thread_id: &str, checkpoint_id: Option<String>) {
    let state = state.clone();
    let thread_id = thread_id.to_string();
    tokio::spawn(async move {
        let flow = match state.flows.get(FLOW_REPORT) {
            Ok(flow) => flow,
            Err(error) => {
                warn!(thread_id, %error, "background run could not resolve flow");
                return;
            }
        };
        let mut config = state.run_config(&thread_id, Value::Null);
        if let Some(id) = checkpoint_id {
            config = config.with_checkpoint_id(id);
        }
        if let Err(error) = flow.invoke(None, &config).await {
            warn!(thread_id, %error, "background report run failed");
        }
    });
}

/// `GET /report/{thread_id}/load` - latest checkpoint projected to the
/// client state shape.
pub async fn load(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = parse_thread_id(&thread_id)?;
    let checkpoint = require_checkpoint(&state, &thread_id).await?;
    state.threads.update_last_accessed(&thread_id).await?;
    Ok(Json(json!({
        "thread_id": thread_id,
        "snapshot_id": checkpoint.id,
        "next": checkpoint.next_nodes,
        "state": report_state_projection(&checkpoint.values),
        "visited_nodes": checkpoint.values.get("visited_nodes").cloned().unwrap_or(json!([])),
    })))
}

/// `GET /report/{thread_id}/status` - progress counts plus trailing logs.
pub async fn status(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = parse_thread_id(&thread_id)?;
    let checkpoint = require_checkpoint(&state, &thread_id).await?;
    let values = &checkpoint.values;

    let total_clusters = values
        .get("clusters_all")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let chapters = values
        .get("chapters")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let pending = values
        .get("pending_clusters")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let failed = values
        .get("failed_chapter_ids")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let has_final = values
        .get("final_report")
        .is_some_and(|report| !report.is_null());
    let run_status = if has_final {
        "completed"
    } else if checkpoint.is_terminal() {
        "idle"
    } else {
        "running"
    };
    let logs: Vec<Value> = values
        .get("logs")
        .and_then(Value::as_array)
        .map(|logs| {
            logs.iter()
                .rev()
                .take(SNAPSHOT_LOG_LINES)
                .rev()
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({
        "thread_id": thread_id,
        "status": run_status,
        "total_clusters": total_clusters,
        "chapters_completed": chapters,
        "pending_clusters": pending,
        "failed_chapters": failed,
        "logs": logs,
    })))
}

/// `GET /report/{thread_id}/snapshots` - checkpoint ancestry, newest first.
pub async fn snapshots(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = parse_thread_id(&thread_id)?;
    let flow = state.flows.get(FLOW_REPORT)?;
    let history = flow.state_history(&thread_id).await?;
    if history.is_empty() {
        return Err(RelayError::NotFound(format!("thread {thread_id}")));
    }
    let entries: Vec<Value> = history
        .iter()
        .map(|checkpoint| {
            json!({
                "snapshot_id": checkpoint.id,
                "parent_snapshot_id": checkpoint.parent_id,
                "created_at": checkpoint.created_at.to_rfc3339(),
                "next": checkpoint.next_nodes,
                "chapters": checkpoint
                    .values
                    .get("chapters")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({"thread_id": thread_id, "snapshots": entries})))
}

async fn download(state: &AppState, thread_id: &str, filename: &str, markdown: &str) -> Result<Response> {
    let bytes = state.renderer.render_markdown(filename, markdown).await?;
    let disposition = format!(
        "attachment; filename=\"{filename}.{}\"",
        state.renderer.file_extension()
    );
    let mut response = bytes.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(state.renderer.content_type())
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or(HeaderValue::from_static("attachment")),
    );
    Ok(response)
}

/// `GET /report/{thread_id}/chapters/download`.
pub async fn download_chapters(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Response> {
    let thread_id = parse_thread_id(&thread_id)?;
    let checkpoint = require_checkpoint(&state, &thread_id).await?;
    let chapters: Vec<String> = checkpoint
        .values
        .get("chapters")
        .and_then(Value::as_array)
        .map(|chapters| {
            chapters
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if chapters.is_empty() {
        return Err(RelayError::NotFound("no chapters yet".into()));
    }
    let markdown = chapters.join("\n\n---\n\n");
    download(&state, &thread_id, "hoofdstukken", &markdown).await
}

/// `GET /report/{thread_id}/final-report/download`.
pub async fn download_final_report(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(thread_id): Path<String>,
) -> Result<Response> {
    let thread_id = parse_thread_id(&thread_id)?;
    let checkpoint = require_checkpoint(&state, &thread_id).await?;
    let report = checkpoint
        .values
        .get("final_report")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::NotFound("no final report yet".into()))?
        .to_string();
    download(&state, &thread_id, "eindrapport", &report).await
}
