//! Event emitter: graph execution events to sequenced SSE envelopes.
//!
//! Consumes the raw [`ExecEvent`] stream of one run and produces the wire
//! envelopes of the SSE protocol: node/tool/llm lifecycle events with
//! previews, token `content_chunk`s, and throttled checkpoint-authoritative
//! `state_snapshot`s. The emitter guarantees that every `node_start` it
//! emitted is matched by a `node_end` before the stream closes, even when
//! the runtime went silent on a dispatch-routed node - the finalizer
//! synthesizes the missing ends.
//!
//! The emitter reads checkpoints through the flow handle; the flow never
//! references the emitter.

pub mod envelope;
pub mod preview;
pub mod snapshots;

use self::envelope::{Envelope, EventType};
use self::preview::{
    preview, value_preview, CHAPTER_PREVIEW_LENGTH, DEFAULT_PREVIEW_LENGTH,
    TOOL_RESULT_PREVIEW_LENGTH,
};
use crate::flows::FLOW_REPORT;
use chrono::Utc;
use flowgraph_core::{messages_from_value, CancelFlag, CompiledFlow, ExecEvent, MessageRole};
use futures::Stream;
use llm_gateway::MetricsRegistry;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Nodes that can go silent when routed through a dispatch edge; the
/// finalizer synthesizes their start/end pairs so clients see matched pairs.
const SILENT_PRONE_NODES: &[&str] = &["splitter_node", "batch_processor_node"];

/// Per-stream emitter configuration.
#[derive(Debug, Clone)]
pub struct EmitterSettings {
    /// Flow kind (`chat` or `report`).
    pub flow: String,
    pub thread_id: String,
    /// Minimum gap between long-running-task snapshots.
    pub snapshot_throttle: Duration,
    /// A task older than this makes throttled snapshots fire.
    pub long_task_threshold: Duration,
    /// Report keep-alive snapshot cadence.
    pub keepalive: Duration,
    /// Graph nodes surfaced as `node_start`/`node_end`.
    pub tracked_nodes: HashSet<String>,
    /// Tool name to logical tool-node name.
    pub tool_node_names: HashMap<String, String>,
}

/// One tracked node invocation, as exposed in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub run_id: String,
    pub node: String,
    /// Milliseconds since the epoch.
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(skip)]
    started: Instant,
}

impl TaskInfo {
    fn new(run_id: String, node: String, input_preview: Option<String>, metadata: Value) -> Self {
        Self {
            run_id,
            node,
            started_at: Utc::now().timestamp_millis(),
            input_preview,
            metadata,
            ended_at: None,
            output_preview: None,
            started: Instant::now(),
        }
    }
}

fn display_run_id(node: &str, run_id: &str) -> String {
    format!("{node}_{run_id}")
}

/// Transforms one run's execution events into SSE envelopes.
pub struct EventEmitter {
    settings: EmitterSettings,
    flow: Arc<CompiledFlow>,
    cancel: CancelFlag,
    metrics: Arc<MetricsRegistry>,
    seq: u64,
    snapshot_seq: u64,
    last_snapshot: Instant,
    accumulated: String,
    visited_nodes: Vec<String>,
    current_node: Option<String>,
    active_tasks: Vec<TaskInfo>,
    task_history: Vec<TaskInfo>,
    active_cluster_ids: HashSet<String>,
    seen_nodes: HashSet<String>,
    first_token_recorded: bool,
    initial_snapshot_done: bool,
    finished: bool,
}

impl EventEmitter {
    pub fn new(
        settings: EmitterSettings,
        flow: Arc<CompiledFlow>,
        cancel: CancelFlag,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            settings,
            flow,
            cancel,
            metrics,
            seq: 0,
            snapshot_seq: 0,
            last_snapshot: Instant::now(),
            accumulated: String::new(),
            visited_nodes: Vec::new(),
            current_node: None,
            active_tasks: Vec::new(),
            task_history: Vec::new(),
            active_cluster_ids: HashSet::new(),
            seen_nodes: HashSet::new(),
            first_token_recorded: false,
            initial_snapshot_done: false,
            finished: false,
        }
    }

    /// Drive the emitter over a run's event channel.
    pub fn into_stream(mut self, mut rx: mpsc::Receiver<ExecEvent>) -> impl Stream<Item = Envelope> + Send {
        async_stream::stream! {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !self.finished {
                let batch = self.next_batch(&mut rx, &mut ticker).await;
                let Some(batch) = batch else { break };
                for envelope in batch {
                    yield envelope;
                }
            }

            for envelope in self.finalize().await {
                yield envelope;
            }
        }
    }

    /// Wait for the next event or timer tick and return the envelopes to
    /// emit. `None` means the run's channel closed.
    async fn next_batch(
        &mut self,
        rx: &mut mpsc::Receiver<ExecEvent>,
        ticker: &mut tokio::time::Interval,
    ) -> Option<Vec<Envelope>> {
        tokio::select! {
            maybe_event = rx.recv() => {
                let event = maybe_event?;
                Some(self.handle_event(event).await)
            }
            _ = ticker.tick() => {
                Some(self.maybe_periodic_snapshot().await.into_iter().collect())
            }
        }
    }

    fn is_report(&self) -> bool {
        self.settings.flow == FLOW_REPORT
    }

    fn next_envelope(&mut self, event_type: EventType, run_id: Option<String>, payload: Value) -> Envelope {
        self.seq += 1;
        Envelope::new(
            event_type,
            &self.settings.thread_id,
            &self.settings.flow,
            self.seq,
            run_id,
            payload,
        )
    }

    async fn snapshot_envelope(&mut self, final_snapshot: bool) -> Envelope {
        let checkpoint = self
            .flow
            .state(&self.settings.thread_id)
            .await
            .ok()
            .flatten();
        self.snapshot_seq += 1;
        let payload = {
            let active: Vec<&TaskInfo> = self.active_tasks.iter().collect();
            snapshots::snapshot_payload(
                checkpoint.as_ref(),
                self.snapshot_seq,
                &self.visited_nodes,
                &active,
                &self.task_history,
                &self.active_cluster_ids,
                self.is_report(),
                final_snapshot,
            )
        };
        self.last_snapshot = Instant::now();
        self.next_envelope(EventType::StateSnapshot, None, payload)
    }

    async fn maybe_periodic_snapshot(&mut self) -> Option<Envelope> {
        let elapsed = self.last_snapshot.elapsed();
        let long_running = self
            .active_tasks
            .iter()
            .any(|task| task.started.elapsed() >= self.settings.long_task_threshold);
        if elapsed >= self.settings.snapshot_throttle && long_running {
            debug!(thread_id = %self.settings.thread_id, "long-running task snapshot");
            return Some(self.snapshot_envelope(false).await);
        }
        if self.is_report() && elapsed >= self.settings.keepalive {
            debug!(thread_id = %self.settings.thread_id, "keep-alive snapshot");
            return Some(self.snapshot_envelope(false).await);
        }
        None
    }

    async fn handle_event(&mut self, event: ExecEvent) -> Vec<Envelope> {
        match event {
            ExecEvent::GraphStart => {
                vec![self.next_envelope(EventType::GraphStart, None, json!({}))]
            }

            ExecEvent::CheckpointSaved { .. } => {
                // The first checkpoint of a report run backs the initial
                // snapshot (raw procedures, parked clusters, empty status).
                if self.is_report() && !self.initial_snapshot_done {
                    self.initial_snapshot_done = true;
                    vec![self.snapshot_envelope(false).await]
                } else {
                    Vec::new()
                }
            }

            ExecEvent::NodeStart { node, run_id, input } => {
                if self.is_report() && self.cancel.load(Ordering::Relaxed) {
                    // Cancelled: no new nodes reach the client.
                    self.finished = true;
                    return Vec::new();
                }
                if !self.settings.tracked_nodes.contains(&node) {
                    return Vec::new();
                }
                let display = display_run_id(&node, &run_id);
                if self.visited_nodes.last() != Some(&node) {
                    self.visited_nodes.push(node.clone());
                }
                self.current_node = Some(node.clone());
                self.seen_nodes.insert(node.clone());

                let mut metadata = Value::Null;
                if self.is_report() && node == "analyst_node" {
                    if let Some(file_id) = input["cluster"]["file_id"].as_str() {
                        metadata = json!({"file_id": file_id});
                        self.active_cluster_ids.insert(file_id.to_string());
                    }
                }
                let input_preview = Some(value_preview(&input, DEFAULT_PREVIEW_LENGTH));
                self.active_tasks.push(TaskInfo::new(
                    display.clone(),
                    node.clone(),
                    input_preview.clone(),
                    metadata,
                ));

                let mut out = vec![self.next_envelope(
                    EventType::NodeStart,
                    Some(display),
                    json!({"node": node, "input_preview": input_preview}),
                )];
                // Immediate snapshot so the UI highlights the cluster.
                if self.is_report() && node == "analyst_node" {
                    out.push(self.snapshot_envelope(false).await);
                }
                out
            }

            ExecEvent::NodeEnd { node, run_id, output } => {
                if !self.settings.tracked_nodes.contains(&node) {
                    return Vec::new();
                }
                let display = display_run_id(&node, &run_id);
                let preview_len = if node == "analyst_node" {
                    CHAPTER_PREVIEW_LENGTH
                } else {
                    DEFAULT_PREVIEW_LENGTH
                };
                let output_preview = Some(value_preview(&output, preview_len));
                let ended = self.end_task(&display, &node, output_preview.clone());
                if let Some(task) = &ended {
                    if let Some(file_id) = task.metadata["file_id"].as_str() {
                        self.active_cluster_ids.remove(file_id);
                    }
                }

                let mut out = vec![self.next_envelope(
                    EventType::NodeEnd,
                    Some(display),
                    json!({"node": node, "output_preview": output_preview}),
                )];
                // Checkpoint-authoritative snapshot after every node end.
                out.push(self.snapshot_envelope(false).await);
                out
            }

            ExecEvent::LlmStart {
                node,
                run_id,
                call_id,
                model,
                input,
            } => {
                vec![self.next_envelope(
                    EventType::LlmStart,
                    Some(display_run_id(&node, &run_id)),
                    json!({
                        "model": model,
                        "input_preview": value_preview(&input, DEFAULT_PREVIEW_LENGTH),
                        "call_id": call_id,
                    }),
                )]
            }

            ExecEvent::LlmToken {
                node,
                run_id,
                delta,
                ..
            } => {
                if delta.is_empty() {
                    return Vec::new();
                }
                self.accumulated.push_str(&delta);
                self.first_token_recorded = true;
                let accumulated = self.accumulated.clone();
                vec![self.next_envelope(
                    EventType::ContentChunk,
                    Some(display_run_id(&node, &run_id)),
                    json!({"content": delta, "accumulated": accumulated}),
                )]
            }

            ExecEvent::LlmEnd {
                node,
                run_id,
                call_id,
                model,
                input,
                output,
                usage,
            } => {
                let execution_metrics = self
                    .metrics
                    .call_snapshot(&self.settings.thread_id, &call_id)
                    .map(|snapshot| json!(snapshot));
                vec![self.next_envelope(
                    EventType::LlmEnd,
                    Some(display_run_id(&node, &run_id)),
                    json!({
                        "model": model,
                        "input_preview": value_preview(&input, DEFAULT_PREVIEW_LENGTH),
                        "output_preview": value_preview(&output, DEFAULT_PREVIEW_LENGTH),
                        "token_usage": usage,
                        "execution_metrics": execution_metrics,
                    }),
                )]
            }

            ExecEvent::ToolStart {
                node: _,
                run_id,
                tool,
                args,
            } => {
                // Tool invocations appear as their own logical node; keyed by
                // the logical name so their start/end pair is distinct from
                // the hosting node's pair.
                let logical = self.tool_node_name(&tool);
                let display = display_run_id(&logical, &run_id);
                let args_preview = value_preview(&args, DEFAULT_PREVIEW_LENGTH);
                vec![
                    self.next_envelope(
                        EventType::NodeStart,
                        Some(display.clone()),
                        json!({"node": logical}),
                    ),
                    self.next_envelope(
                        EventType::ToolStart,
                        Some(display),
                        json!({"tool_name": tool, "args_preview": args_preview}),
                    ),
                ]
            }

            ExecEvent::ToolEnd {
                node: _,
                run_id,
                tool,
                args,
                result,
            } => {
                let logical = self.tool_node_name(&tool);
                let display = display_run_id(&logical, &run_id);
                let args_preview = value_preview(&args, DEFAULT_PREVIEW_LENGTH);
                vec![
                    self.next_envelope(
                        EventType::ToolEnd,
                        Some(display.clone()),
                        json!({
                            "tool_name": tool,
                            "args_preview": args_preview,
                            "result_preview": preview(&result, TOOL_RESULT_PREVIEW_LENGTH),
                        }),
                    ),
                    self.next_envelope(
                        EventType::NodeEnd,
                        Some(display),
                        json!({"node": logical}),
                    ),
                ]
            }

            ExecEvent::GraphEnd { state } => {
                self.finished = true;
                let response = self.extract_response(&state);
                vec![self.next_envelope(EventType::GraphEnd, None, json!({"response": response}))]
            }

            ExecEvent::GraphError { error } => {
                self.finished = true;
                vec![self.next_envelope(
                    EventType::Error,
                    None,
                    json!({"error": error, "error_type": "internal"}),
                )]
            }
        }
    }

    fn tool_node_name(&self, tool: &str) -> String {
        self.settings
            .tool_node_names
            .get(tool)
            .cloned()
            .unwrap_or_else(|| tool.to_string())
    }

    fn end_task(&mut self, display: &str, node: &str, output_preview: Option<String>) -> Option<TaskInfo> {
        let idx = self
            .active_tasks
            .iter()
            .position(|task| task.run_id == display)
            // Runtimes that lost the run id: most recent unended task with
            // the same node name.
            .or_else(|| self.active_tasks.iter().rposition(|task| task.node == node));
        let idx = idx?;
        let mut task = self.active_tasks.remove(idx);
        task.ended_at = Some(Utc::now().timestamp_millis());
        task.output_preview = output_preview;
        self.task_history.push(task.clone());
        Some(task)
    }

    fn extract_response(&self, state: &Value) -> Value {
        if self.is_report() {
            return state.get("final_report").cloned().unwrap_or(Value::Null);
        }
        messages_from_value(&state["messages"])
            .ok()
            .and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Ai)
                    .map(|m| Value::String(m.content.clone()))
            })
            .unwrap_or(Value::Null)
    }

    async fn finalize(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();

        // Every emitted node_start gets its node_end.
        let stranded: Vec<TaskInfo> = self.active_tasks.drain(..).collect();
        for mut task in stranded {
            task.ended_at = Some(Utc::now().timestamp_millis());
            out.push(self.next_envelope(
                EventType::NodeEnd,
                Some(task.run_id.clone()),
                json!({"node": task.node, "output_preview": Value::Null, "synthesized": true}),
            ));
            self.task_history.push(task);
        }

        // Dispatch-edge routing can swallow these nodes' events entirely;
        // synthesize an ordered pair so clients can match them up.
        if self.is_report() {
            for node in SILENT_PRONE_NODES {
                if self.settings.tracked_nodes.contains(*node)
                    && !self.seen_nodes.contains(*node)
                    && self.seq > 1
                {
                    let display = display_run_id(node, "synthesized");
                    out.push(self.next_envelope(
                        EventType::NodeStart,
                        Some(display.clone()),
                        json!({"node": node, "synthesized": true}),
                    ));
                    out.push(self.next_envelope(
                        EventType::NodeEnd,
                        Some(display),
                        json!({"node": node, "synthesized": true}),
                    ));
                }
            }
        }

        out.push(self.snapshot_envelope(true).await);
        out
    }
}
