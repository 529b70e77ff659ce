//! Per-thread execution metrics.
//!
//! The registry keeps one record per LLM call (TTFT, token counts,
//! duration), embedding usage, and tool costs, keyed by thread. A
//! `run_id -> call_id` table resolves stream events back to their call
//! record. A lookup miss at `llm_end` time is a hard error: it is logged,
//! counted, and the event goes out without execution metrics - there is no
//! "most recent start" fallback, which would be order-sensitive across
//! concurrent calls.

use crate::client::{ModelConfig, TokenUsage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

#[derive(Debug, Clone)]
struct CallRecord {
    call_id: String,
    run_id: Option<String>,
    model: String,
    config: ModelConfig,
    started: Instant,
    timestamp: DateTime<Utc>,
    ttft_ms: Option<u64>,
    duration_ms: Option<u64>,
    input_tokens: u64,
    output_tokens: u64,
    thinking_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRecord {
    model: String,
    input_tokens: u64,
    duration_ms: u64,
}

#[derive(Debug, Default)]
struct ThreadMetrics {
    calls: HashMap<String, CallRecord>,
    call_order: Vec<String>,
    run_index: HashMap<String, String>,
    embeddings: Vec<EmbeddingRecord>,
    tool_calls: u64,
    tool_duration_ms: u64,
    tool_cost: f64,
}

/// Snapshot of one LLM call, attached to `llm_end` events.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub model: String,
    pub config: ModelConfig,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate snapshot of one thread's execution.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub llm_calls: Vec<CallSnapshot>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_thinking_tokens: u64,
    /// TTFT of the first call that streamed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ttft_ms: Option<u64>,
    pub tool_calls: u64,
    pub tool_duration_ms: u64,
    pub tool_cost: f64,
    pub embedding_calls: usize,
}

/// Thread-safe, in-memory metrics store.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    threads: DashMap<String, Arc<Mutex<ThreadMetrics>>>,
    lookup_misses: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn thread(&self, thread_id: &str) -> Arc<Mutex<ThreadMetrics>> {
        self.threads
            .entry(thread_id.to_string())
            .or_default()
            .clone()
    }

    /// Start tracking a thread. Idempotent.
    pub fn init_execution(&self, thread_id: &str) {
        self.threads.entry(thread_id.to_string()).or_default();
    }

    /// Record the start of an LLM call.
    pub fn record_llm_start(
        &self,
        thread_id: &str,
        call_id: &str,
        model: &str,
        config: ModelConfig,
        run_id: Option<&str>,
    ) {
        let thread = self.thread(thread_id);
        let mut metrics = thread.lock();
        metrics.calls.insert(
            call_id.to_string(),
            CallRecord {
                call_id: call_id.to_string(),
                run_id: run_id.map(str::to_string),
                model: model.to_string(),
                config,
                started: Instant::now(),
                timestamp: Utc::now(),
                ttft_ms: None,
                duration_ms: None,
                input_tokens: 0,
                output_tokens: 0,
                thinking_tokens: None,
            },
        );
        metrics.call_order.push(call_id.to_string());
        if let Some(run_id) = run_id {
            metrics
                .run_index
                .insert(run_id.to_string(), call_id.to_string());
        }
    }

    /// Record TTFT for a call, if not already recorded.
    pub fn record_first_token(&self, thread_id: &str, call_id: &str) {
        let thread = self.thread(thread_id);
        let mut metrics = thread.lock();
        if let Some(record) = metrics.calls.get_mut(call_id) {
            if record.ttft_ms.is_none() {
                record.ttft_ms = Some(record.started.elapsed().as_millis() as u64);
            }
        }
    }

    /// Record TTFT addressed by run id.
    pub fn record_first_token_by_run(&self, thread_id: &str, run_id: &str) {
        if let Some(call_id) = self.resolve_call_id(thread_id, run_id) {
            self.record_first_token(thread_id, &call_id);
        }
    }

    /// Resolve a run id to its call id. Misses are counted and logged.
    pub fn resolve_call_id(&self, thread_id: &str, run_id: &str) -> Option<String> {
        let thread = self.thread(thread_id);
        let metrics = thread.lock();
        match metrics.run_index.get(run_id) {
            Some(call_id) => Some(call_id.clone()),
            None => {
                drop(metrics);
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                error!(thread_id, run_id, "no call record for run id");
                None
            }
        }
    }

    /// Record token usage for a call.
    pub fn record_llm_usage(&self, thread_id: &str, call_id: &str, usage: &TokenUsage) {
        let thread = self.thread(thread_id);
        let mut metrics = thread.lock();
        if let Some(record) = metrics.calls.get_mut(call_id) {
            record.input_tokens = usage.input_tokens;
            record.output_tokens = usage.output_tokens;
            record.thinking_tokens = usage.thinking_tokens;
        }
    }

    /// Close a call record with its total duration.
    pub fn record_llm_end(&self, thread_id: &str, call_id: &str) {
        let thread = self.thread(thread_id);
        let mut metrics = thread.lock();
        if let Some(record) = metrics.calls.get_mut(call_id) {
            record.duration_ms = Some(record.started.elapsed().as_millis() as u64);
        }
    }

    /// Record one embedding invocation.
    pub fn record_embedding(&self, thread_id: &str, model: &str, input_tokens: u64, duration: Duration) {
        let thread = self.thread(thread_id);
        thread.lock().embeddings.push(EmbeddingRecord {
            model: model.to_string(),
            input_tokens,
            duration_ms: duration.as_millis() as u64,
        });
    }

    /// Record one tool invocation's duration and optional cost.
    pub fn record_tool_cost(&self, thread_id: &str, duration: Duration, cost: Option<f64>) {
        let thread = self.thread(thread_id);
        let mut metrics = thread.lock();
        metrics.tool_calls += 1;
        metrics.tool_duration_ms += duration.as_millis() as u64;
        metrics.tool_cost += cost.unwrap_or(0.0);
    }

    /// Snapshot a call record for `llm_end` payloads.
    pub fn call_snapshot(&self, thread_id: &str, call_id: &str) -> Option<CallSnapshot> {
        let thread = self.thread(thread_id);
        let metrics = thread.lock();
        metrics.calls.get(call_id).map(snapshot_call)
    }

    /// Aggregate view of one thread.
    pub fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        let thread = Arc::clone(self.threads.get(thread_id)?.value());
        let metrics = thread.lock();
        Some(snapshot_thread(&metrics))
    }

    /// Snapshot and stop tracking a thread.
    pub fn finalize(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        let (_, thread) = self.threads.remove(thread_id)?;
        let metrics = thread.lock();
        Some(snapshot_thread(&metrics))
    }

    /// Number of run-id lookups that found no call record.
    pub fn lookup_misses(&self) -> u64 {
        self.lookup_misses.load(Ordering::Relaxed)
    }
}

fn snapshot_call(record: &CallRecord) -> CallSnapshot {
    CallSnapshot {
        call_id: record.call_id.clone(),
        run_id: record.run_id.clone(),
        model: record.model.clone(),
        config: record.config.clone(),
        input_tokens: record.input_tokens,
        output_tokens: record.output_tokens,
        thinking_tokens: record.thinking_tokens,
        ttft_ms: record.ttft_ms,
        duration_ms: record.duration_ms,
        timestamp: record.timestamp,
    }
}

fn snapshot_thread(metrics: &ThreadMetrics) -> ThreadSnapshot {
    let llm_calls: Vec<CallSnapshot> = metrics
        .call_order
        .iter()
        .filter_map(|id| metrics.calls.get(id))
        .map(snapshot_call)
        .collect();
    ThreadSnapshot {
        total_input_tokens: llm_calls.iter().map(|c| c.input_tokens).sum(),
        total_output_tokens: llm_calls.iter().map(|c| c.output_tokens).sum(),
        total_thinking_tokens: llm_calls.iter().filter_map(|c| c.thinking_tokens).sum(),
        first_ttft_ms: llm_calls.iter().find_map(|c| c.ttft_ms),
        tool_calls: metrics.tool_calls,
        tool_duration_ms: metrics.tool_duration_ms,
        tool_cost: metrics.tool_cost,
        embedding_calls: metrics.embeddings.len(),
        llm_calls,
    }
}
