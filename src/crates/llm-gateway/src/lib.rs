//! llm-gateway - the policy envelope around every LLM call
//!
//! The upstream model router already handles vendor quotas and basic
//! retries; this crate adds the per-process policies the orchestration
//! service needs so that streaming agents, tool-returning calls, and batch
//! analysts sharing one pool cannot starve each other:
//!
//! 1. named concurrency pools (semaphores) per caller class
//! 2. strict per-model request spacing for low-RPM model tiers
//! 3. dynamic timeouts derived from input size
//! 4. a retry envelope for transient failures
//! 5. per-thread execution metrics (TTFT, token counts, tool durations)
//!
//! The vendor itself stays behind the [`ModelRouter`] trait.

pub mod client;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod metrics;
pub mod retry;
pub mod timeout;
pub mod tokens;

pub use client::{
    ChatRequest, ChatResponse, ChunkStream, ModelConfig, ModelProfile, ModelRouter, StreamChunk,
    TokenUsage, ToolSchema,
};
pub use error::{GatewayError, Result};
pub use gateway::{CallContext, ModelGateway};
pub use limits::{PoolSemaphores, RequestSpacer};
pub use metrics::{MetricsRegistry, ThreadSnapshot};
pub use retry::RetryConfig;
pub use timeout::{dynamic_timeout, DEFAULT_TIMEOUT};
