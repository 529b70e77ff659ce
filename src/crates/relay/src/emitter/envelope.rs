//! SSE wire envelope.
//!
//! Every event on a stream is wrapped in the same envelope: a type tag, the
//! thread and flow identity, a per-connection sequence number starting at 1
//! and strictly increasing by 1, a millisecond timestamp, and the optional
//! run id of the node instance the event belongs to.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Wire event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GraphStart,
    NodeStart,
    NodeEnd,
    ToolStart,
    ToolEnd,
    LlmStart,
    LlmEnd,
    ContentChunk,
    StateSnapshot,
    GraphEnd,
    Error,
}

/// One SSE event.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub thread_id: String,
    pub flow: String,
    pub seq: u64,
    /// Milliseconds since the epoch.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        event_type: EventType,
        thread_id: &str,
        flow: &str,
        seq: u64,
        run_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            thread_id: thread_id.to_string(),
            flow: flow.to_string(),
            seq,
            ts: Utc::now().timestamp_millis(),
            run_id,
            payload,
        }
    }

    /// JSON body for the `data:` line.
    pub fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
