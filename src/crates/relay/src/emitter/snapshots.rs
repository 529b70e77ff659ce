//! State-snapshot projection.
//!
//! Snapshots are checkpoint-authoritative: the payload is built from the
//! latest persisted checkpoint plus the emitter's in-memory task bookkeeping
//! (active tasks, visited nodes, highlighted clusters). Clients treat them
//! as the source of truth across reconnects.

use super::TaskInfo;
use flowgraph_checkpoint::Checkpoint;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Report-state fields projected into snapshots.
const REPORT_STATE_FIELDS: &[&str] = &[
    "raw_procedures",
    "pending_clusters",
    "clusters_all",
    "chapters",
    "chapters_by_file_id",
    "failed_chapter_ids",
    "final_report",
    "cluster_status",
];

/// Number of trailing log lines included in snapshots and status responses.
pub const SNAPSHOT_LOG_LINES: usize = 20;

/// Project checkpoint values to the client-facing report state shape.
pub fn report_state_projection(values: &Map<String, Value>) -> Value {
    let mut state = Map::new();
    for field in REPORT_STATE_FIELDS {
        if let Some(value) = values.get(*field) {
            state.insert((*field).to_string(), value.clone());
        }
    }
    if let Some(logs) = values.get("logs").and_then(Value::as_array) {
        let tail: Vec<Value> = logs
            .iter()
            .rev()
            .take(SNAPSHOT_LOG_LINES)
            .rev()
            .cloned()
            .collect();
        state.insert("logs".to_string(), Value::Array(tail));
    }
    Value::Object(state)
}

/// Cluster status summary: which clusters are running now and which are
/// already completed.
pub fn cluster_status_summary(
    values: Option<&Map<String, Value>>,
    active_cluster_ids: &HashSet<String>,
) -> Value {
    let mut active: Vec<&String> = active_cluster_ids.iter().collect();
    active.sort();
    let completed: Vec<String> = values
        .and_then(|v| v.get("cluster_status"))
        .and_then(Value::as_object)
        .map(|status| {
            let mut ids: Vec<String> = status
                .iter()
                .filter(|(_, s)| s["status"].as_str() == Some("completed"))
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        })
        .unwrap_or_default();
    json!({
        "active_cluster_ids": active,
        "completed_cluster_ids": completed,
    })
}

/// Assemble the full snapshot payload.
#[allow(clippy::too_many_arguments)]
pub fn snapshot_payload(
    checkpoint: Option<&Checkpoint>,
    snapshot_seq: u64,
    visited_nodes: &[String],
    active_tasks: &[&TaskInfo],
    task_history: &[TaskInfo],
    active_cluster_ids: &HashSet<String>,
    is_report: bool,
    final_snapshot: bool,
) -> Value {
    let snapshot_id = checkpoint
        .map(|cp| cp.id.clone())
        .unwrap_or_else(|| format!("pending-{snapshot_seq}"));
    let next = if final_snapshot {
        Vec::new()
    } else {
        checkpoint.map(|cp| cp.next_nodes.clone()).unwrap_or_default()
    };

    let mut payload = json!({
        "snapshot_id": snapshot_id,
        "snapshot_seq": snapshot_seq,
        "next": next,
        "visited_nodes": visited_nodes,
        "active_tasks": active_tasks,
        "task_history": task_history,
    });

    if is_report {
        let values = checkpoint.map(|cp| &cp.values);
        payload["report_state"] = values
            .map(report_state_projection)
            .unwrap_or_else(|| json!({}));
        payload["cluster_status"] = cluster_status_summary(values, active_cluster_ids);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values_with_status() -> Map<String, Value> {
        let mut values = Map::new();
        values.insert(
            "cluster_status".into(),
            json!({
                "a": {"status": "completed", "retries": 0},
                "b": {"status": "failed", "retries": 1},
                "c": {"status": "completed", "retries": 0},
            }),
        );
        values.insert("chapters".into(), json!(["h1", "h2"]));
        values.insert(
            "logs".into(),
            json!((0..30).map(|i| format!("regel {i}")).collect::<Vec<_>>()),
        );
        values
    }

    #[test]
    fn completed_ids_come_from_cluster_status() {
        let values = values_with_status();
        let active = HashSet::from(["b".to_string()]);
        let summary = cluster_status_summary(Some(&values), &active);
        assert_eq!(summary["completed_cluster_ids"], json!(["a", "c"]));
        assert_eq!(summary["active_cluster_ids"], json!(["b"]));
    }

    #[test]
    fn projection_keeps_last_log_lines() {
        let values = values_with_status();
        let state = report_state_projection(&values);
        let logs = state["logs"].as_array().unwrap();
        assert_eq!(logs.len(), SNAPSHOT_LOG_LINES);
        assert_eq!(logs.last().unwrap(), "regel 29");
    }

    #[test]
    fn final_snapshot_has_empty_next() {
        let checkpoint = Checkpoint::new(
            None,
            values_with_status(),
            vec!["editor_node".into()],
            vec![],
        );
        let payload = snapshot_payload(
            Some(&checkpoint),
            4,
            &["splitter_node".to_string()],
            &[],
            &[],
            &HashSet::new(),
            true,
            true,
        );
        assert_eq!(payload["next"], json!([]));
        assert_eq!(payload["snapshot_id"], json!(checkpoint.id));
        assert!(payload["report_state"]["chapters"].is_array());
    }
}
