//! Integration tests for the super-step runtime: scheduling, fan-out joins,
//! reducers, recursion limits, cancellation, and checkpoint resume.

use flowgraph_checkpoint::{CheckpointStore, InMemoryStore};
use flowgraph_core::{
    DispatchMessage, ExecEvent, FlowBuilder, NodeResult, Route, RunConfig, StateSchema, END, START,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

#[tokio::test]
async fn linear_flow_runs_to_completion() {
    let flow = FlowBuilder::new("linear")
        .add_node("double", |input: Value, _ctx| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(NodeResult::Update(json!({"n": n * 2})))
        })
        .add_edge(START, "double")
        .add_edge("double", END)
        .compile()
        .unwrap()
        .with_checkpointer(store());

    let config = RunConfig::new("t1");
    let result = flow.invoke(Some(json!({"n": 21})), &config).await.unwrap();
    assert_eq!(result["n"], 42);
}

#[tokio::test]
async fn conditional_loop_terminates() {
    let branches = HashMap::from([
        ("again".to_string(), "step".to_string()),
        ("done".to_string(), END.to_string()),
    ]);
    let flow = FlowBuilder::new("loop")
        .add_node("step", |input: Value, _ctx| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(NodeResult::Update(json!({"n": n + 1})))
        })
        .add_edge(START, "step")
        .add_conditional_edge(
            "step",
            |state: &Value, _output: &Value| {
                if state["n"].as_i64().unwrap_or(0) < 3 {
                    Route::To("step".into())
                } else {
                    Route::End
                }
            },
            branches,
        )
        .compile()
        .unwrap()
        .with_checkpointer(store());

    let result = flow
        .invoke(Some(json!({"n": 0})), &RunConfig::new("t1"))
        .await
        .unwrap();
    assert_eq!(result["n"], 3);
}

#[tokio::test]
async fn fan_out_joins_once() {
    // splitter dispatches three workers; collector must run exactly once
    // after all of them, with every worker output reduced into state.
    let flow = FlowBuilder::new("fanout")
        .with_schema(StateSchema::new().append_field("results").append_field("joins"))
        .add_node("splitter", |_input: Value, _ctx| async move {
            let dispatches = (0..3)
                .map(|i| DispatchMessage::new("worker", json!({"item": i})))
                .collect();
            Ok(NodeResult::Dispatch(dispatches))
        })
        .add_node("worker", |input: Value, _ctx| async move {
            let item = input["item"].as_i64().unwrap();
            Ok(NodeResult::Update(json!({"results": [item * 10]})))
        })
        .add_node("collector", |_input: Value, _ctx| async move {
            Ok(NodeResult::Update(json!({"joins": ["joined"]})))
        })
        .add_edge(START, "splitter")
        .add_edge("worker", "collector")
        .add_edge("collector", END)
        .declare_dispatch("splitter", "worker")
        .compile()
        .unwrap()
        .with_checkpointer(store());

    let result = flow
        .invoke(Some(json!({})), &RunConfig::new("t1"))
        .await
        .unwrap();

    let mut results: Vec<i64> = result["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec![0, 10, 20]);
    assert_eq!(result["joins"], json!(["joined"]));
}

#[tokio::test]
async fn parallel_instances_get_distinct_run_ids() {
    let flow = Arc::new(
        FlowBuilder::new("fanout")
            .add_node("splitter", |_input: Value, _ctx| async move {
                Ok(NodeResult::Dispatch(vec![
                    DispatchMessage::new("worker", json!({"i": 0})),
                    DispatchMessage::new("worker", json!({"i": 1})),
                ]))
            })
            .add_node("worker", |_input: Value, _ctx| async move {
                Ok(NodeResult::none())
            })
            .add_edge(START, "splitter")
            .compile()
            .unwrap()
            .with_checkpointer(store()),
    );

    let mut rx = flow.stream(Some(json!({})), RunConfig::new("t1"));
    let mut worker_runs = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ExecEvent::NodeStart { node, run_id, .. } = event {
            if node == "worker" {
                worker_runs.push(run_id);
            }
        }
    }
    assert_eq!(worker_runs.len(), 2);
    assert_ne!(worker_runs[0], worker_runs[1]);
}

#[tokio::test]
async fn every_node_start_has_matching_node_end() {
    let flow = Arc::new(
        FlowBuilder::new("pairs")
            .add_node("a", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
            .add_node("b", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END)
            .compile()
            .unwrap()
            .with_checkpointer(store()),
    );

    let mut rx = flow.stream(Some(json!({})), RunConfig::new("t1"));
    let mut started = Vec::new();
    let mut ended = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            ExecEvent::NodeStart { run_id, .. } => started.push(run_id),
            ExecEvent::NodeEnd { run_id, .. } => ended.push(run_id),
            _ => {}
        }
    }
    started.sort();
    ended.sort();
    assert_eq!(started, ended);
}

#[tokio::test]
async fn recursion_limit_fails_the_run() {
    let flow = FlowBuilder::new("infinite")
        .add_node("spin", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
        .add_edge(START, "spin")
        .add_edge("spin", "spin")
        .compile()
        .unwrap()
        .with_checkpointer(store());

    let config = RunConfig::new("t1").with_recursion_limit(5);
    let err = flow.invoke(Some(json!({})), &config).await.unwrap_err();
    assert!(err.to_string().contains("recursion limit"));
}

#[tokio::test]
async fn cancellation_stops_scheduling_new_nodes() {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_inner = Arc::clone(&cancel);

    let flow = FlowBuilder::new("cancellable")
        .with_schema(StateSchema::new().append_field("visited"))
        .add_node("first", move |_input: Value, _ctx| {
            let cancel = Arc::clone(&cancel_inner);
            async move {
                // cancel mid-run; this node still completes.
                cancel.store(true, Ordering::Relaxed);
                Ok(NodeResult::Update(json!({"visited": ["first"]})))
            }
        })
        .add_node("second", |_input: Value, _ctx| async move {
            Ok(NodeResult::Update(json!({"visited": ["second"]})))
        })
        .add_edge(START, "first")
        .add_edge("first", "second")
        .add_edge("second", END)
        .compile()
        .unwrap()
        .with_checkpointer(store());

    let config = RunConfig::new("t1").with_cancel(cancel);
    let result = flow.invoke(Some(json!({})), &config).await.unwrap();
    assert_eq!(result["visited"], json!(["first"]));
}

#[tokio::test]
async fn resume_continues_from_checkpoint() {
    let checkpoints = store();
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_inner = Arc::clone(&cancel);

    let build = |cancel_on_first: Option<Arc<AtomicBool>>| {
        FlowBuilder::new("resumable")
            .with_schema(StateSchema::new().append_field("visited"))
            .add_node("first", move |_input: Value, _ctx| {
                let cancel = cancel_on_first.clone();
                async move {
                    if let Some(flag) = cancel {
                        flag.store(true, Ordering::Relaxed);
                    }
                    Ok(NodeResult::Update(json!({"visited": ["first"]})))
                }
            })
            .add_node("second", |_input: Value, _ctx| async move {
                Ok(NodeResult::Update(json!({"visited": ["second"]})))
            })
            .add_edge(START, "first")
            .add_edge("first", "second")
            .add_edge("second", END)
            .compile()
            .unwrap()
    };

    // First run: cancelled after "first" completes.
    let flow = build(Some(cancel_inner)).with_checkpointer(checkpoints.clone());
    let config = RunConfig::new("t1").with_cancel(cancel);
    flow.invoke(Some(json!({})), &config).await.unwrap();

    let latest = checkpoints.get_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.next_nodes, vec!["second".to_string()]);

    // Resume with no input: continues from the checkpoint.
    let flow = build(None).with_checkpointer(checkpoints.clone());
    let result = flow.invoke(None, &RunConfig::new("t1")).await.unwrap();
    assert_eq!(result["visited"], json!(["first", "second"]));

    let latest = checkpoints.get_latest("t1").await.unwrap().unwrap();
    assert!(latest.is_terminal());
}

#[tokio::test]
async fn update_state_writes_a_descendant_checkpoint() {
    let checkpoints = store();
    let flow = FlowBuilder::new("updatable")
        .add_node("noop", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
        .add_edge(START, "noop")
        .add_edge("noop", END)
        .compile()
        .unwrap()
        .with_checkpointer(checkpoints.clone());

    flow.invoke(Some(json!({"k": 1})), &RunConfig::new("t1"))
        .await
        .unwrap();
    let before = checkpoints.get_latest("t1").await.unwrap().unwrap();
    let after = flow.update_state("t1", json!({"k": 2})).await.unwrap();
    assert_eq!(after.parent_id.as_deref(), Some(before.id.as_str()));
    assert_eq!(after.values["k"], 2);
}

#[tokio::test]
async fn structure_lists_dispatch_edges() {
    let flow = FlowBuilder::new("introspect")
        .add_node("splitter", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
        .add_node("worker", |_input: Value, _ctx| async move { Ok(NodeResult::none()) })
        .add_edge(START, "splitter")
        .declare_dispatch("splitter", "worker")
        .compile()
        .unwrap();

    let structure = flow.structure();
    assert!(structure
        .edges
        .iter()
        .any(|e| e.from == "splitter" && e.to == "worker" && e.kind == "dispatch"));
}
