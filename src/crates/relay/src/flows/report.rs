//! The report flow.
//!
//! ```text
//! START → splitter_node ─▶ [Dispatch(analyst_node, cluster)]* (first batch)
//!             │ remainder parked in pending_clusters
//! analyst_node → batch_processor_node ─▶ next batch | retry pass | editor_node
//! batch_processor_noop_node → END
//! editor_node → END
//! ```
//!
//! The splitter groups raw procedures by a deterministic key derived from
//! the document-id prefix and dispatches the first `MAX_PARALLEL_WORKERS`
//! clusters. Each analyst runs a ReAct-style inner agent (with the consult
//! chat subgraph as one of its tools) under a wall-clock budget; failures
//! never raise - they mark the cluster failed so the reducer keeps
//! advancing. The batch processor feeds the next batch, replays failed
//! clusters while retries remain, and finally hands the chapters to the
//! editor in `clusters_all` order.

use super::FlowServices;
use crate::tools::ToolContext;
use flowgraph_core::{
    CompiledFlow, DispatchMessage, ExecEvent, FlowBuilder, GraphError, Message, NodeContext,
    NodeResult, Route, StateSchema, END, START,
};
use llm_gateway::{CallContext, ChatRequest, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

pub const SPLITTER_NODE: &str = "splitter_node";
pub const ANALYST_NODE: &str = "analyst_node";
pub const BATCH_PROCESSOR_NODE: &str = "batch_processor_node";
pub const BATCH_PROCESSOR_NOOP_NODE: &str = "batch_processor_noop_node";
pub const EDITOR_NODE: &str = "editor_node";

/// Inner-agent turn budget per analyst.
const MAX_ANALYST_TURNS: usize = 6;

const DEFAULT_ANALYST_PROMPT: &str = "Je bent een beleidsanalist bij Opgroeien. Schrijf op \
basis van de aangeleverde procedures een volledig hoofdstuk in het Nederlands over \
'{topic}' binnen '{department}'. Raadpleeg je tools waar nodig en verwijs naar de \
procedurenummers.";

const DEFAULT_EDITOR_PROMPT: &str = "Je bent eindredacteur. Voeg de aangeleverde hoofdstukken \
samen tot één samenhangend rapport in markdown, met een korte inleiding en een conclusie. \
Behoud de volgorde van de hoofdstukken.";

/// One analyst work unit: the procedures sharing a derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub file_id: String,
    pub department_name: String,
    pub topic_name: String,
    pub procedures: Vec<Value>,
}

/// Document-id prefix to (department, topic). Unknown prefixes collect
/// under a rest bucket.
const CLUSTER_TABLE: &[(&str, &str, &str)] = &[
    ("AV", "Kinderopvang", "Algemene voorwaarden"),
    ("VG", "Kinderopvang", "Veiligheid en gezondheid"),
    ("PM", "Personeel", "Medewerkers en vorming"),
    ("KB", "Kwaliteit", "Kwaliteitsbeleid"),
    ("HA", "Kwaliteit", "Handhaving"),
];

fn safe_key(department: &str, topic: &str) -> String {
    format!("{department} {topic}")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Resolve a document id like `PR-AV-02` to its cluster metadata.
pub fn cluster_meta(doc_id: &str) -> (String, String, String) {
    let prefix = doc_id.split('-').nth(1).unwrap_or_default();
    let (department, topic) = CLUSTER_TABLE
        .iter()
        .find(|(p, _, _)| *p == prefix)
        .map(|(_, d, t)| (*d, *t))
        .unwrap_or(("Overig", "Overige procedures"));
    (
        department.to_string(),
        topic.to_string(),
        safe_key(department, topic),
    )
}

/// Group procedures into clusters, ordered by key for determinism.
pub fn split_clusters(raw_procedures: &[Value]) -> Vec<Cluster> {
    let mut grouped: BTreeMap<String, Cluster> = BTreeMap::new();
    for procedure in raw_procedures {
        let doc_id = procedure
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (department, topic, key) = cluster_meta(doc_id);
        grouped
            .entry(key.clone())
            .or_insert_with(|| Cluster {
                file_id: key,
                department_name: department,
                topic_name: topic,
                procedures: Vec::new(),
            })
            .procedures
            .push(procedure.clone());
    }
    grouped.into_values().collect()
}

fn report_schema() -> StateSchema {
    StateSchema::new()
        .append_field("chapters")
        .append_field("logs")
        .append_field("visited_nodes")
        .merge_field("chapters_by_file_id")
        .merge_field("cluster_status")
}

/// Build the report flow.
pub fn build_report_flow(services: Arc<FlowServices>) -> Result<CompiledFlow, GraphError> {
    let splitter_services = Arc::clone(&services);
    let analyst_services = Arc::clone(&services);
    let processor_services = Arc::clone(&services);
    let editor_services = services;

    let splitter_branches = HashMap::from([
        ("empty".to_string(), EDITOR_NODE.to_string()),
        ("dispatched".to_string(), END.to_string()),
    ]);
    let processor_branches = HashMap::from([
        ("dispatch".to_string(), ANALYST_NODE.to_string()),
        ("editor".to_string(), EDITOR_NODE.to_string()),
        ("noop".to_string(), BATCH_PROCESSOR_NOOP_NODE.to_string()),
    ]);

    FlowBuilder::new("report")
        .with_schema(report_schema())
        .add_node(SPLITTER_NODE, move |input, ctx| {
            let services = Arc::clone(&splitter_services);
            async move { splitter_node(services, input, ctx).await }
        })
        .add_node(ANALYST_NODE, move |input, ctx| {
            let services = Arc::clone(&analyst_services);
            async move { analyst_node(services, input, ctx).await }
        })
        .add_node(BATCH_PROCESSOR_NODE, move |input, ctx| {
            let services = Arc::clone(&processor_services);
            async move { batch_processor_node(services, input, ctx).await }
        })
        .add_node(BATCH_PROCESSOR_NOOP_NODE, |_input, _ctx| async move {
            Ok(NodeResult::Update(
                json!({"visited_nodes": [BATCH_PROCESSOR_NOOP_NODE]}),
            ))
        })
        .add_node(EDITOR_NODE, move |input, ctx| {
            let services = Arc::clone(&editor_services);
            async move { editor_node(services, input, ctx).await }
        })
        .add_edge(START, SPLITTER_NODE)
        .add_conditional_edge(SPLITTER_NODE, splitter_router, splitter_branches)
        .add_edge(ANALYST_NODE, BATCH_PROCESSOR_NODE)
        .add_conditional_edge(BATCH_PROCESSOR_NODE, batch_router, processor_branches)
        .add_edge(BATCH_PROCESSOR_NOOP_NODE, END)
        .add_edge(EDITOR_NODE, END)
        .declare_dispatch(SPLITTER_NODE, ANALYST_NODE)
        .declare_dispatch(BATCH_PROCESSOR_NODE, ANALYST_NODE)
        .compile()
}

/// An empty input set skips straight to the editor.
fn splitter_router(state: &Value, _output: &Value) -> Route {
    let has_clusters = state["clusters_all"]
        .as_array()
        .is_some_and(|clusters| !clusters.is_empty());
    if has_clusters {
        Route::End
    } else {
        Route::To(EDITOR_NODE.to_string())
    }
}

fn batch_router(_state: &Value, output: &Value) -> Route {
    match output["batch_decision"].as_str() {
        Some("dispatch") => {
            let dispatches = output["next_batch"]
                .as_array()
                .map(|batch| {
                    batch
                        .iter()
                        .map(|item| DispatchMessage::new(ANALYST_NODE, item.clone()))
                        .collect()
                })
                .unwrap_or_default();
            Route::Dispatch(dispatches)
        }
        Some("editor") => Route::To(EDITOR_NODE.to_string()),
        _ => Route::To(BATCH_PROCESSOR_NOOP_NODE.to_string()),
    }
}

async fn splitter_node(
    services: Arc<FlowServices>,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let raw: Vec<Value> = input["raw_procedures"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let clusters = split_clusters(&raw);
    let batch_size = services.settings.limits.max_parallel_workers.max(1);
    let first: Vec<Cluster> = clusters.iter().take(batch_size).cloned().collect();
    let pending: Vec<Cluster> = clusters.iter().skip(batch_size).cloned().collect();

    let mut status = Map::new();
    for cluster in &clusters {
        status.insert(
            cluster.file_id.clone(),
            json!({"status": "pending", "retries": 0}),
        );
    }

    info!(
        thread_id = %ctx.thread_id,
        procedures = raw.len(),
        clusters = clusters.len(),
        first_batch = first.len(),
        "splitter grouped procedures"
    );

    let dispatches = first
        .iter()
        .map(|cluster| {
            DispatchMessage::new(ANALYST_NODE, json!({"cluster": cluster, "retry": 0}))
        })
        .collect();

    Ok(NodeResult::Mixed {
        update: json!({
            "clusters_all": clusters,
            "pending_clusters": pending,
            "cluster_status": status,
            "logs": [format!(
                "Splitter: {} procedures in {} clusters, eerste batch {}",
                raw.len(),
                clusters.len(),
                first.len()
            )],
            "visited_nodes": [SPLITTER_NODE],
        }),
        dispatches,
    })
}

async fn analyst_node(
    services: Arc<FlowServices>,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let cluster: Cluster = serde_json::from_value(input["cluster"].clone())
        .map_err(|e| GraphError::node_execution(ANALYST_NODE, format!("bad cluster payload: {e}")))?;
    let retry = input["retry"].as_u64().unwrap_or(0);
    let budget = Duration::from_secs(services.settings.limits.analyst_timeout_seconds);
    let file_id = cluster.file_id.clone();

    let outcome = tokio::time::timeout(budget, run_analyst(&services, &cluster, &ctx)).await;
    match outcome {
        Ok(Ok(chapter)) => {
            let mut by_file = Map::new();
            by_file.insert(file_id.clone(), json!(chapter));
            let mut status = Map::new();
            status.insert(file_id, json!({"status": "completed", "retries": retry}));
            Ok(NodeResult::Update(json!({
                "chapters": [chapter],
                "chapters_by_file_id": by_file,
                "cluster_status": status,
                "logs": [format!("Analyst voltooide hoofdstuk '{}'", cluster.topic_name)],
                "visited_nodes": [ANALYST_NODE],
            })))
        }
        Ok(Err(error)) => {
            warn!(thread_id = %ctx.thread_id, file_id, %error, "analyst failed");
            Ok(failed_update(&cluster, retry, &error.to_string()))
        }
        Err(_) => {
            warn!(
                thread_id = %ctx.thread_id,
                file_id,
                budget_s = budget.as_secs(),
                "analyst timed out"
            );
            Ok(failed_update(
                &cluster,
                retry,
                &format!("timeout na {}s", budget.as_secs()),
            ))
        }
    }
}

fn failed_update(cluster: &Cluster, retry: u64, reason: &str) -> NodeResult {
    let mut status = Map::new();
    status.insert(
        cluster.file_id.clone(),
        json!({"status": "failed", "retries": retry}),
    );
    NodeResult::Update(json!({
        "cluster_status": status,
        "logs": [format!(
            "Analyst faalde voor '{}': {}",
            cluster.topic_name, reason
        )],
        "visited_nodes": [ANALYST_NODE],
    }))
}

/// The analyst's ReAct inner loop: invoke with tools bound, answer tool
/// calls, repeat until the model produces the chapter text.
async fn run_analyst(
    services: &Arc<FlowServices>,
    cluster: &Cluster,
    ctx: &NodeContext,
) -> Result<String, GraphError> {
    let model = ctx
        .config
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| services.settings.flows.analyst_model.clone());
    let vars = HashMap::from([
        ("department", cluster.department_name.clone()),
        ("topic", cluster.topic_name.clone()),
    ]);
    let system = services
        .prompts
        .render("analyst_system", &vars)
        .unwrap_or_else(|_| {
            DEFAULT_ANALYST_PROMPT
                .replace("{topic}", &cluster.topic_name)
                .replace("{department}", &cluster.department_name)
        });
    let procedures = serde_json::to_string_pretty(&cluster.procedures)?;

    let mut messages = vec![
        Message::system(system),
        Message::human(format!("Dit zijn de procedures:\n\n{procedures}")),
    ];
    let schemas = services.analyst_tool_schemas();
    let tool_ctx = ToolContext::new(&ctx.thread_id, &ctx.run_id);

    for _turn in 0..MAX_ANALYST_TURNS {
        let request = ChatRequest::new(&model, messages.clone())
            .with_tools(schemas.clone())
            .with_config(services.settings.model_config(&model));
        let (message, _usage) =
            invoke_with_events(services, ctx, ANALYST_NODE, "analyst", &request).await?;
        if !message.has_tool_calls() {
            return Ok(message.content);
        }
        messages.push(message.clone());
        for call in &message.tool_calls {
            ctx.events
                .emit(ExecEvent::ToolStart {
                    node: ANALYST_NODE.to_string(),
                    run_id: ctx.run_id.clone(),
                    tool: call.name.clone(),
                    args: call.args.clone(),
                })
                .await;
            let started = Instant::now();
            let result = services
                .tools
                .dispatch(&call.name, call.args.clone(), &tool_ctx)
                .await;
            services
                .gateway
                .metrics()
                .record_tool_cost(&ctx.thread_id, started.elapsed(), None);
            ctx.events
                .emit(ExecEvent::ToolEnd {
                    node: ANALYST_NODE.to_string(),
                    run_id: ctx.run_id.clone(),
                    tool: call.name.clone(),
                    args: call.args.clone(),
                    result: result.clone(),
                })
                .await;
            messages.push(Message::tool(result, &call.call_id));
        }
    }
    Err(GraphError::node_execution(
        ANALYST_NODE,
        format!("no chapter after {MAX_ANALYST_TURNS} turns"),
    ))
}

async fn batch_processor_node(
    services: Arc<FlowServices>,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let pending: Vec<Cluster> = input["pending_clusters"]
        .as_array()
        .map(|clusters| {
            clusters
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let batch_size = services.settings.limits.max_parallel_workers.max(1);

    if !pending.is_empty() {
        let take = batch_size.min(pending.len());
        let batch: Vec<Value> = pending[..take]
            .iter()
            .map(|cluster| json!({"cluster": cluster, "retry": 0}))
            .collect();
        let rest: Vec<Cluster> = pending[take..].to_vec();
        info!(
            thread_id = %ctx.thread_id,
            dispatched = take,
            remaining = rest.len(),
            "batch processor feeding next batch"
        );
        return Ok(NodeResult::Update(json!({
            "pending_clusters": rest,
            "next_batch": batch,
            "batch_decision": "dispatch",
            "logs": [format!("Batch processor: volgende batch van {take} clusters")],
            "visited_nodes": [BATCH_PROCESSOR_NODE],
        })));
    }

    // No pending work: replay failed clusters while retries remain.
    let status_map = input["cluster_status"].as_object().cloned().unwrap_or_default();
    let clusters_all: Vec<Cluster> = input["clusters_all"]
        .as_array()
        .map(|clusters| {
            clusters
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let max_retries = services.settings.limits.analyst_max_retries as u64;

    let mut retry_batch = Vec::new();
    let mut status_updates = Map::new();
    let mut exhausted = Vec::new();
    for (file_id, status) in &status_map {
        if status["status"].as_str() != Some("failed") {
            continue;
        }
        let retries = status["retries"].as_u64().unwrap_or(0);
        if retries < max_retries {
            if let Some(cluster) = clusters_all.iter().find(|c| &c.file_id == file_id) {
                retry_batch.push(json!({"cluster": cluster, "retry": retries + 1}));
                status_updates.insert(
                    file_id.clone(),
                    json!({"status": "retrying", "retries": retries + 1}),
                );
            }
        } else {
            exhausted.push(file_id.clone());
        }
    }
    exhausted.sort();

    if !retry_batch.is_empty() {
        info!(
            thread_id = %ctx.thread_id,
            retried = retry_batch.len(),
            "batch processor replaying failed clusters"
        );
        return Ok(NodeResult::Update(json!({
            "next_batch": retry_batch.clone(),
            "batch_decision": "dispatch",
            "cluster_status": status_updates,
            "failed_chapter_ids": exhausted,
            "logs": [format!("Batch processor: {} mislukte clusters opnieuw", retry_batch.len())],
            "visited_nodes": [BATCH_PROCESSOR_NODE],
        })));
    }

    Ok(NodeResult::Update(json!({
        "next_batch": [],
        "batch_decision": "editor",
        "failed_chapter_ids": exhausted,
        "logs": ["Batch processor: alle clusters verwerkt, door naar de editor"],
        "visited_nodes": [BATCH_PROCESSOR_NODE],
    })))
}

async fn editor_node(
    services: Arc<FlowServices>,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let clusters_all: Vec<Cluster> = input["clusters_all"]
        .as_array()
        .map(|clusters| {
            clusters
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let by_file = input["chapters_by_file_id"]
        .as_object()
        .cloned()
        .unwrap_or_default();
    let failed: Vec<String> = input["failed_chapter_ids"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // Chapters in clusters_all order; failures become an explicit gap note
    // so a partial report is still produced.
    let mut sections = Vec::new();
    for cluster in &clusters_all {
        match by_file.get(&cluster.file_id).and_then(Value::as_str) {
            Some(chapter) => sections.push(chapter.to_string()),
            None => sections.push(format!(
                "> Ontbrekend hoofdstuk: {} ({})",
                cluster.topic_name, cluster.file_id
            )),
        }
    }
    let joined = sections.join("\n\n---\n\n");

    let model = ctx
        .config
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| services.settings.flows.editor_model.clone());
    let system = services
        .prompts
        .render("editor_system", &HashMap::new())
        .unwrap_or_else(|_| DEFAULT_EDITOR_PROMPT.to_string());
    let mut instruction = format!("Dit zijn de hoofdstukken:\n\n{joined}");
    if !failed.is_empty() {
        instruction.push_str(&format!(
            "\n\nLet op: voor deze onderdelen kon geen hoofdstuk gemaakt worden: {}.",
            failed.join(", ")
        ));
    }
    let request = ChatRequest::new(&model, vec![Message::system(system), Message::human(instruction)])
        .with_config(services.settings.model_config(&model));

    let (message, _usage) =
        invoke_with_events(&services, &ctx, EDITOR_NODE, "analyst", &request).await?;

    Ok(NodeResult::Update(json!({
        "final_report": message.content,
        "logs": ["Editor: eindrapport opgesteld"],
        "visited_nodes": [EDITOR_NODE],
    })))
}

/// Non-streaming gateway call with `llm_start`/`llm_end` events around it.
async fn invoke_with_events(
    services: &Arc<FlowServices>,
    ctx: &NodeContext,
    node: &str,
    pool: &str,
    request: &ChatRequest,
) -> Result<(Message, TokenUsage), GraphError> {
    let call_id = Uuid::new_v4().to_string();
    let call_ctx = CallContext::new(&ctx.thread_id)
        .with_run_id(&ctx.run_id)
        .with_node(node)
        .with_pool(pool)
        .with_cancel(Arc::clone(&ctx.cancel))
        .with_call_id(&call_id);

    ctx.events
        .emit(ExecEvent::LlmStart {
            node: node.to_string(),
            run_id: ctx.run_id.clone(),
            call_id: call_id.clone(),
            model: request.model.clone(),
            input: json!(request.messages),
        })
        .await;

    let result = services.gateway.invoke(&call_ctx, request).await;
    match result {
        Ok((response, usage)) => {
            ctx.events
                .emit(ExecEvent::LlmEnd {
                    node: node.to_string(),
                    run_id: ctx.run_id.clone(),
                    call_id,
                    model: request.model.clone(),
                    input: json!(request.messages),
                    output: json!(response.message),
                    usage: Some(json!(usage)),
                })
                .await;
            Ok((response.message, usage))
        }
        Err(error) => {
            ctx.events
                .emit(ExecEvent::LlmEnd {
                    node: node.to_string(),
                    run_id: ctx.run_id.clone(),
                    call_id,
                    model: request.model.clone(),
                    input: json!(request.messages),
                    output: json!({"error": error.to_string()}),
                    usage: None,
                })
                .await;
            Err(GraphError::node_execution(node, error.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn procedure(id: &str) -> Value {
        json!({"id": id, "title": format!("Procedure {id}"), "body": "..."})
    }

    #[test]
    fn cluster_meta_maps_known_prefixes() {
        let (department, topic, key) = cluster_meta("PR-AV-02");
        assert_eq!(department, "Kinderopvang");
        assert_eq!(topic, "Algemene voorwaarden");
        assert_eq!(key, "kinderopvang_algemene_voorwaarden");
    }

    #[test]
    fn unknown_prefixes_fall_back_to_rest_bucket() {
        let (department, _, key) = cluster_meta("PR-XX-99");
        assert_eq!(department, "Overig");
        assert_eq!(key, "overig_overige_procedures");
    }

    #[test]
    fn splitting_is_deterministic_and_grouped() {
        let raw = vec![
            procedure("PR-VG-01"),
            procedure("PR-AV-01"),
            procedure("PR-AV-02"),
        ];
        let clusters = split_clusters(&raw);
        assert_eq!(clusters.len(), 2);
        // BTreeMap ordering: algemene voorwaarden before veiligheid
        assert_eq!(clusters[0].file_id, "kinderopvang_algemene_voorwaarden");
        assert_eq!(clusters[0].procedures.len(), 2);
        assert_eq!(clusters[1].procedures.len(), 1);

        let again = split_clusters(&raw);
        assert_eq!(
            clusters.iter().map(|c| &c.file_id).collect::<Vec<_>>(),
            again.iter().map(|c| &c.file_id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn batch_router_dispatches_batches() {
        let output = json!({
            "batch_decision": "dispatch",
            "next_batch": [
                {"cluster": {"file_id": "a", "department_name": "d", "topic_name": "t", "procedures": []}, "retry": 0},
                {"cluster": {"file_id": "b", "department_name": "d", "topic_name": "t", "procedures": []}, "retry": 0},
            ],
        });
        match batch_router(&Value::Null, &output) {
            Route::Dispatch(dispatches) => {
                assert_eq!(dispatches.len(), 2);
                assert!(dispatches.iter().all(|d| d.node == ANALYST_NODE));
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn batch_router_routes_to_editor_when_done() {
        let output = json!({"batch_decision": "editor", "next_batch": []});
        assert!(matches!(
            batch_router(&Value::Null, &output),
            Route::To(node) if node == EDITOR_NODE
        ));
    }

    #[test]
    fn splitter_router_skips_to_editor_on_empty_input() {
        let empty = json!({"clusters_all": []});
        assert!(matches!(
            splitter_router(&empty, &Value::Null),
            Route::To(node) if node == EDITOR_NODE
        ));
        let full = json!({"clusters_all": [{"file_id": "x"}]});
        assert!(matches!(splitter_router(&full, &Value::Null), Route::End));
    }
}
