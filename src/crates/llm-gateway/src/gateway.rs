//! The gateway proper: policy-ordered wrapper around the model router.
//!
//! Policies apply in a fixed order: pool semaphore, strict-model spacing,
//! dynamic timeout, retry envelope, router call. Metrics are recorded for
//! every call; failures come back as typed [`GatewayError`] kinds so the
//! caller can decide whether to fail the node or mark a chapter failed.

use crate::client::{ChatRequest, ChatResponse, ChunkStream, ModelRouter, TokenUsage};
use crate::error::{GatewayError, Result};
use crate::limits::{PoolSemaphores, RequestSpacer};
use crate::metrics::MetricsRegistry;
use crate::retry::{retry_with, RetryConfig};
use crate::timeout::dynamic_timeout;
use crate::tokens::{estimate_text, estimate_tokens};
use flowgraph_core::CancelFlag;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Caller identity and hints propagated into every call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub thread_id: String,
    /// Run id of the node invocation issuing the call.
    pub run_id: Option<String>,
    /// Node name, for logs.
    pub node: Option<String>,
    /// Concurrency pool to draw a permit from.
    pub pool: Option<String>,
    /// Known input token count; estimated from the prompt when absent.
    pub input_tokens: Option<u64>,
    /// Cancellation flag of the owning thread.
    pub cancel: Option<CancelFlag>,
    /// Call id to record under; generated when absent. Callers that emit
    /// their own `llm_start` events pass it so metrics correlate.
    pub call_id: Option<String>,
}

impl CallContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_input_tokens(mut self, tokens: u64) -> Self {
        self.input_tokens = Some(tokens);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Single entry point for every LLM call in the service.
pub struct ModelGateway {
    router: Arc<dyn ModelRouter>,
    pools: PoolSemaphores,
    spacer: RequestSpacer,
    retry: RetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl ModelGateway {
    pub fn new(router: Arc<dyn ModelRouter>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            router,
            pools: PoolSemaphores::new(),
            spacer: RequestSpacer::new(),
            retry: RetryConfig::default(),
            metrics,
        }
    }

    pub fn with_pools(mut self, pools: PoolSemaphores) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn validate(request: &ChatRequest) -> Result<()> {
        if request.model.is_empty() {
            return Err(GatewayError::InvalidInput("empty model name".into()));
        }
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidInput("empty message list".into()));
        }
        Ok(())
    }

    /// One-shot completion under the full policy envelope. Returns the
    /// response together with its usage (backend-reported, or estimated when
    /// the backend stays silent).
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> Result<(ChatResponse, TokenUsage)> {
        Self::validate(request)?;
        if ctx.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let _permit = self.pools.acquire(ctx.pool.as_deref()).await;
        let profile = self.router.profile(&request.model);
        if profile.strict_rpm {
            self.spacer
                .wait_turn(&request.model, profile.min_request_interval)
                .await;
        }

        let input_tokens = ctx
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&request.messages));
        let timeout = dynamic_timeout(Some(input_tokens));
        let call_id = ctx
            .call_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.metrics.record_llm_start(
            &ctx.thread_id,
            &call_id,
            &request.model,
            request.config.clone(),
            ctx.run_id.as_deref(),
        );
        debug!(
            thread_id = %ctx.thread_id,
            node = ctx.node.as_deref().unwrap_or_default(),
            model = %request.model,
            input_tokens,
            timeout_s = timeout.as_secs(),
            "invoking model"
        );

        let router = Arc::clone(&self.router);
        let request_owned = request.clone();
        let cancel = ctx.cancel.clone();
        let result = retry_with(&self.retry, move |_attempt| {
            let router = Arc::clone(&router);
            let request = request_owned.clone();
            let cancel = cancel.clone();
            async move {
                if cancel
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::Relaxed))
                {
                    return Err(GatewayError::Cancelled);
                }
                match tokio::time::timeout(timeout, router.invoke(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        })
        .await;

        match result {
            Ok(response) => {
                let usage = response.usage.unwrap_or_else(|| TokenUsage {
                    input_tokens,
                    output_tokens: estimate_text(&response.message.content),
                    thinking_tokens: None,
                });
                self.metrics
                    .record_llm_usage(&ctx.thread_id, &call_id, &usage);
                self.metrics.record_llm_end(&ctx.thread_id, &call_id);
                Ok((response, usage))
            }
            Err(error) => {
                self.metrics.record_llm_end(&ctx.thread_id, &call_id);
                warn!(
                    thread_id = %ctx.thread_id,
                    model = %request.model,
                    kind = error.kind(),
                    %error,
                    "model call failed after retries"
                );
                Err(error)
            }
        }
    }

    /// Streaming completion. The pool permit is held for the lifetime of the
    /// returned stream; TTFT is recorded when the first non-empty delta
    /// arrives and usage when the final chunk reports it. Returns the call id
    /// so the caller can correlate its events.
    pub async fn stream(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> Result<(String, ChunkStream)> {
        Self::validate(request)?;
        if ctx.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let permit = self.pools.acquire(ctx.pool.as_deref()).await;
        let profile = self.router.profile(&request.model);
        if profile.strict_rpm {
            self.spacer
                .wait_turn(&request.model, profile.min_request_interval)
                .await;
        }

        let input_tokens = ctx
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&request.messages));
        let timeout = dynamic_timeout(Some(input_tokens));
        let call_id = ctx
            .call_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.metrics.record_llm_start(
            &ctx.thread_id,
            &call_id,
            &request.model,
            request.config.clone(),
            ctx.run_id.as_deref(),
        );

        let router = Arc::clone(&self.router);
        let request_owned = request.clone();
        let upstream = retry_with(&self.retry, move |_attempt| {
            let router = Arc::clone(&router);
            let request = request_owned.clone();
            async move {
                match tokio::time::timeout(timeout, router.stream(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        })
        .await?;

        let metrics = Arc::clone(&self.metrics);
        let thread_id = ctx.thread_id.clone();
        let stream_call_id = call_id.clone();
        let wrapped = async_stream::try_stream! {
            let _permit = permit;
            let mut upstream = upstream;
            let mut first_token_seen = false;
            let mut ended = false;
            while let Some(chunk) = upstream.next().await {
                let chunk = chunk?;
                if !first_token_seen && !chunk.delta.is_empty() {
                    metrics.record_first_token(&thread_id, &stream_call_id);
                    first_token_seen = true;
                }
                if let Some(usage) = &chunk.usage {
                    metrics.record_llm_usage(&thread_id, &stream_call_id, usage);
                }
                if chunk.message.is_some() && !ended {
                    metrics.record_llm_end(&thread_id, &stream_call_id);
                    ended = true;
                }
                yield chunk;
            }
            if !ended {
                metrics.record_llm_end(&thread_id, &stream_call_id);
            }
        };
        Ok((call_id, Box::pin(wrapped)))
    }
}
