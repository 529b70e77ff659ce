//! Request/response types and the pluggable router boundary.
//!
//! The service never talks to a vendor directly. A [`ModelRouter`] maps a
//! logical model name to some backend and exposes `invoke`, `stream`, and
//! per-model profile introspection; everything else in this crate wraps that
//! trait with policy.

use crate::error::Result;
use async_trait::async_trait;
use flowgraph_core::Message;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Per-call model configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
}

/// Declaration of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// One chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Logical model name, resolved by the router.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,
    #[serde(default)]
    pub config: ModelConfig,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            config: ModelConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
}

/// A completed chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The `ai` message, possibly carrying tool calls.
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// One streamed chunk. The final chunk carries the assembled message and,
/// when the backend reports it, usage.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Token(s) appended by this chunk; empty on the final chunk.
    pub delta: String,
    /// Set on the final chunk only.
    pub message: Option<Message>,
    /// Set on the final chunk when known.
    pub usage: Option<TokenUsage>,
}

/// Stream of chunks from one call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Rate characteristics of a logical model.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    /// Strict models (Pro tier, 5 RPM) get request spacing enforced.
    pub strict_rpm: bool,
    /// Minimum gap between request starts for strict models.
    pub min_request_interval: Duration,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            strict_rpm: false,
            min_request_interval: Duration::from_secs(12),
        }
    }
}

impl ModelProfile {
    pub fn strict() -> Self {
        Self {
            strict_rpm: true,
            ..Default::default()
        }
    }
}

/// The pluggable vendor boundary.
#[async_trait]
pub trait ModelRouter: Send + Sync {
    /// One-shot completion.
    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Token-streamed completion.
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Rate/cost characteristics of a logical model.
    fn profile(&self, model: &str) -> ModelProfile;
}
