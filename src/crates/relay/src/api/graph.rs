//! Graph introspection: `/graph/structure` and `/graph/state`.

use crate::auth::Principal;
use crate::emitter::snapshots::report_state_projection;
use crate::error::{RelayError, Result};
use crate::flows::FLOW_REPORT;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct StructureQuery {
    /// Flow kind (`chat`/`report`) or a full flow tag.
    pub flow: String,
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub thread_id: String,
}

fn resolve_kind(state: &AppState, flow: &str) -> Result<&'static str> {
    match flow {
        "chat" => Ok("chat"),
        "report" => Ok("report"),
        tag => state
            .flows
            .kind_for_tag(tag)
            .ok_or_else(|| RelayError::NotFound(format!("unknown flow: {tag}"))),
    }
}

/// Static node/edge description, dispatch fan-outs included.
pub async fn structure(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Query(query): Query<StructureQuery>,
) -> Result<Json<Value>> {
    let kind = resolve_kind(&state, &query.flow)?;
    let flow = state.flows.get(kind)?;
    Ok(Json(json!(flow.structure())))
}

/// Current state projection of one thread.
pub async fn state(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Query(query): Query<StateQuery>,
) -> Result<Json<Value>> {
    let record = state
        .threads
        .get(&query.thread_id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("thread {}", query.thread_id)))?;
    let kind = record
        .flow
        .as_deref()
        .and_then(|tag| state.flows.kind_for_tag(tag))
        .ok_or_else(|| RelayError::NotFound(format!("thread {} has no flow", query.thread_id)))?;

    let flow = state.flows.get(kind)?;
    let checkpoint = flow
        .state(&query.thread_id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("no state for thread {}", query.thread_id)))?;

    let projection = if kind == FLOW_REPORT {
        report_state_projection(&checkpoint.values)
    } else {
        Value::Object(checkpoint.values.clone())
    };
    Ok(Json(json!({
        "thread_id": query.thread_id,
        "flow": kind,
        "snapshot_id": checkpoint.id,
        "next": checkpoint.next_nodes,
        "state": projection,
    })))
}
