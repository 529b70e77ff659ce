//! Execution events emitted by the runtime.
//!
//! The runtime (and the nodes themselves, through the [`EventSink`] in their
//! context) publish [`ExecEvent`]s to a bounded channel while a flow runs.
//! The channel is the only coupling between runtime and any downstream
//! consumer: when the consumer lags, the producer awaits channel capacity
//! rather than dropping events; when the consumer goes away entirely, events
//! are discarded and execution continues.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Low-level events produced during flow execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecEvent {
    /// Execution is starting.
    GraphStart,

    /// A node invocation began.
    NodeStart {
        node: String,
        run_id: String,
        input: Value,
    },

    /// A node invocation finished.
    NodeEnd {
        node: String,
        run_id: String,
        output: Value,
    },

    /// An LLM call began inside a node.
    LlmStart {
        node: String,
        run_id: String,
        call_id: String,
        model: String,
        input: Value,
    },

    /// One streamed token (or token group) arrived.
    LlmToken {
        node: String,
        run_id: String,
        call_id: String,
        delta: String,
    },

    /// An LLM call completed.
    LlmEnd {
        node: String,
        run_id: String,
        call_id: String,
        model: String,
        input: Value,
        output: Value,
        usage: Option<Value>,
    },

    /// A tool invocation began inside a node.
    ToolStart {
        node: String,
        run_id: String,
        tool: String,
        args: Value,
    },

    /// A tool invocation finished.
    ToolEnd {
        node: String,
        run_id: String,
        tool: String,
        args: Value,
        result: String,
    },

    /// A checkpoint was written at the end of a super-step.
    CheckpointSaved { checkpoint_id: String },

    /// Execution finished; carries the final state.
    GraphEnd { state: Value },

    /// Execution failed.
    GraphError { error: String },
}

/// Cloneable handle nodes use to publish events.
///
/// A sink constructed with [`EventSink::noop`] swallows everything, which is
/// what `invoke` (non-streaming) uses.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ExecEvent>>,
}

impl EventSink {
    /// A sink that forwards into the given channel.
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards every event.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Publish an event. Awaits channel capacity; a closed channel (consumer
    /// gone) is not an error - the run keeps going.
    pub async fn emit(&self, event: ExecEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
