//! Shared harness for flow/emitter integration tests: a scripted model
//! router, fake domain tools, and helpers that run a flow and collect the
//! full envelope stream.

use async_trait::async_trait;
use flowgraph_checkpoint::InMemoryStore;
use flowgraph_core::{CancelFlag, Message, MessageRole, RunConfig, ToolCall};
use futures::StreamExt;
use llm_gateway::{
    ChatRequest, ChatResponse, ChunkStream, GatewayError, MetricsRegistry, ModelGateway,
    ModelProfile, ModelRouter, PoolSemaphores, RetryConfig, StreamChunk, TokenUsage,
};
use relay::config::Settings;
use relay::emitter::envelope::{Envelope, EventType};
use relay::emitter::{EmitterSettings, EventEmitter};
use relay::flows::FlowRegistry;
use relay::prompts::PromptLoader;
use relay::tools::{Tool, ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

pub type Script = dyn Fn(&ChatRequest) -> Result<ChatResponse, GatewayError> + Send + Sync;

/// Router driven by a test-provided closure. Streams split the response in
/// two deltas plus a final chunk.
pub struct ScriptedRouter {
    script: Box<Script>,
}

impl ScriptedRouter {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<ChatResponse, GatewayError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
        }
    }
}

#[async_trait]
impl ModelRouter for ScriptedRouter {
    async fn invoke(&self, request: &ChatRequest) -> llm_gateway::Result<ChatResponse> {
        (self.script)(request)
    }

    async fn stream(&self, request: &ChatRequest) -> llm_gateway::Result<ChunkStream> {
        let response = self.invoke(request).await?;
        let content = response.message.content.clone();
        let mid = content.len() / 2;
        let split = content
            .char_indices()
            .map(|(i, _)| i)
            .min_by_key(|i| i.abs_diff(mid))
            .unwrap_or(0);
        let (head, tail) = content.split_at(split);
        let chunks = vec![
            Ok(StreamChunk {
                delta: head.to_string(),
                ..Default::default()
            }),
            Ok(StreamChunk {
                delta: tail.to_string(),
                ..Default::default()
            }),
            Ok(StreamChunk {
                delta: String::new(),
                message: Some(response.message),
                usage: response.usage,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn profile(&self, _model: &str) -> ModelProfile {
        ModelProfile::default()
    }
}

pub fn ai_text(text: impl Into<String>) -> ChatResponse {
    ChatResponse {
        message: Message::ai(text),
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            thinking_tokens: None,
        }),
    }
}

pub fn ai_tool_call(name: &str, args: Value) -> ChatResponse {
    ChatResponse {
        message: Message::ai_with_tool_calls(
            "",
            vec![ToolCall {
                call_id: format!("call-{name}"),
                name: name.to_string(),
                args,
            }],
        ),
        usage: None,
    }
}

pub fn has_tool_reply(request: &ChatRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.role == MessageRole::Tool)
}

pub fn system_prompt(request: &ChatRequest) -> String {
    request
        .messages
        .first()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

pub fn last_human(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Human)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

struct LookupTool {
    name: &'static str,
}

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Zoekt een document op."
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        Ok(format!(
            "{}: inhoud van {}",
            self.name,
            args["id"].as_str().unwrap_or("onbekend")
        ))
    }
}

pub struct Harness {
    pub flows: Arc<FlowRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub checkpoints: Arc<InMemoryStore>,
    pub settings: Arc<Settings>,
}

pub fn harness<F, R>(script: R, configure: F) -> Harness
where
    F: FnOnce(&mut Settings),
    R: Fn(&ChatRequest) -> Result<ChatResponse, GatewayError> + Send + Sync + 'static,
{
    let mut settings = Settings::from_defaults();
    configure(&mut settings);
    let settings = Arc::new(settings);

    let metrics = Arc::new(MetricsRegistry::new());
    let pools = PoolSemaphores::new()
        .pool("analyst", settings.limits.report_llm_concurrency)
        .pool("consult", settings.limits.report_consult_llm_concurrency);
    let gateway = Arc::new(
        ModelGateway::new(Arc::new(ScriptedRouter::new(script)), Arc::clone(&metrics))
            .with_pools(pools)
            .with_retry(RetryConfig::new(1).with_jitter(false)),
    );
    let checkpoints = Arc::new(InMemoryStore::new());

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(LookupTool {
        name: "get_procedure",
    }));
    tools.register(Arc::new(LookupTool {
        name: "get_regelgeving",
    }));

    let flows = Arc::new(
        FlowRegistry::build(
            Arc::clone(&settings),
            gateway,
            tools,
            Arc::new(PromptLoader::new(None)),
            checkpoints.clone(),
        )
        .expect("flows compile"),
    );

    Harness {
        flows,
        metrics,
        checkpoints,
        settings,
    }
}

pub fn emitter_settings(harness: &Harness, kind: &str, thread_id: &str) -> EmitterSettings {
    let streaming = &harness.settings.streaming;
    EmitterSettings {
        flow: kind.to_string(),
        thread_id: thread_id.to_string(),
        snapshot_throttle: Duration::from_secs(streaming.snapshot_throttle_interval),
        long_task_threshold: Duration::from_secs(streaming.long_running_task_threshold),
        keepalive: Duration::from_secs(streaming.report_keepalive_interval),
        tracked_nodes: harness.flows.tracked_nodes(kind),
        tool_node_names: harness.flows.services().tools.node_name_map(),
    }
}

/// Run a flow to completion and collect every envelope.
pub async fn run_and_collect(
    harness: &Harness,
    kind: &str,
    thread_id: &str,
    input: Option<Value>,
    cancel: Option<CancelFlag>,
) -> Vec<Envelope> {
    let flow = harness.flows.get(kind).expect("flow exists");
    let cancel = cancel.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    let config = RunConfig::new(thread_id).with_cancel(Arc::clone(&cancel));
    let rx = flow.stream(input, config);
    let emitter = EventEmitter::new(
        emitter_settings(harness, kind, thread_id),
        flow,
        cancel,
        Arc::clone(&harness.metrics),
    );
    emitter.into_stream(rx).collect().await
}

/// Envelope sequence numbers must start at 1 and increase by exactly 1.
pub fn assert_seq_monotonic(envelopes: &[Envelope]) {
    for (index, envelope) in envelopes.iter().enumerate() {
        assert_eq!(
            envelope.seq,
            index as u64 + 1,
            "seq broken at {:?}",
            envelope.event_type
        );
    }
}

/// Every node_start run_id is matched by the same number of node_ends
/// before the stream closes.
pub fn assert_node_pairs(envelopes: &[Envelope]) {
    let starts: Vec<&str> = envelopes
        .iter()
        .filter(|e| e.event_type == EventType::NodeStart)
        .filter_map(|e| e.run_id.as_deref())
        .collect();
    let ends: Vec<&str> = envelopes
        .iter()
        .filter(|e| e.event_type == EventType::NodeEnd)
        .filter_map(|e| e.run_id.as_deref())
        .collect();
    for run_id in &starts {
        let started = starts.iter().filter(|id| *id == run_id).count();
        let ended = ends.iter().filter(|id| *id == run_id).count();
        assert_eq!(started, ended, "unbalanced node events for {run_id}");
    }
    assert_eq!(starts.len(), ends.len(), "stray node_end events");
}

pub fn events_of(envelopes: &[Envelope], event_type: EventType) -> Vec<&Envelope> {
    envelopes
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

pub fn node_starts_for<'a>(envelopes: &'a [Envelope], node: &str) -> Vec<&'a Envelope> {
    envelopes
        .iter()
        .filter(|e| e.event_type == EventType::NodeStart && e.payload["node"] == json!(node))
        .collect()
}
