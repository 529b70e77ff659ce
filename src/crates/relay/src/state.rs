//! Shared application state.
//!
//! Every process-wide handle (pools, registries, buses) is constructed once
//! at boot and threaded through the router via this state object; nothing
//! relies on ambient globals.

use crate::auth::TokenVerifier;
use crate::authz::AccessPolicy;
use crate::cancel::CancelBus;
use crate::config::Settings;
use crate::emitter::envelope::Envelope;
use crate::emitter::{EmitterSettings, EventEmitter};
use crate::error::Result;
use crate::flows::FlowRegistry;
use crate::prompts::PromptLoader;
use crate::render::{DocumentRenderer, JobSubmitter, ProcedureSource};
use crate::threads::ThreadRegistry;
use crate::tools::ToolRegistry;
use flowgraph_checkpoint::CheckpointStore;
use flowgraph_core::{CompiledFlow, RunConfig};
use futures::Stream;
use llm_gateway::{MetricsRegistry, ModelGateway, ModelRouter, PoolSemaphores};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Shared handles for the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub policy: Arc<AccessPolicy>,
    pub threads: Arc<ThreadRegistry>,
    pub cancel: Arc<CancelBus>,
    pub flows: Arc<FlowRegistry>,
    pub gateway: Arc<ModelGateway>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub procedures: Arc<dyn ProcedureSource>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub jobs: Arc<dyn JobSubmitter>,
}

/// External collaborators injected at boot.
pub struct Collaborators {
    pub router: Arc<dyn ModelRouter>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub policy: Arc<AccessPolicy>,
    pub tools: ToolRegistry,
    pub prompts: Arc<PromptLoader>,
    pub procedures: Arc<dyn ProcedureSource>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub jobs: Arc<dyn JobSubmitter>,
}

impl AppState {
    /// Wire the full dependency graph: gateway pools from settings, compiled
    /// flows, registries, cancellation bus.
    pub async fn assemble(
        settings: Arc<Settings>,
        checkpoints: Arc<dyn CheckpointStore>,
        threads: Arc<ThreadRegistry>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let pools = PoolSemaphores::new()
            .pool("analyst", settings.limits.report_llm_concurrency)
            .pool("consult", settings.limits.report_consult_llm_concurrency);
        let gateway = Arc::new(
            ModelGateway::new(collaborators.router, Arc::clone(&metrics)).with_pools(pools),
        );
        let flows = Arc::new(FlowRegistry::build(
            Arc::clone(&settings),
            Arc::clone(&gateway),
            collaborators.tools,
            collaborators.prompts,
            Arc::clone(&checkpoints),
        )?);

        Ok(Self {
            settings,
            verifier: collaborators.verifier,
            policy: collaborators.policy,
            threads,
            cancel: Arc::new(CancelBus::new()),
            flows,
            gateway,
            checkpoints,
            procedures: collaborators.procedures,
            renderer: collaborators.renderer,
            jobs: collaborators.jobs,
        })
    }

    /// Emitter configuration for one stream.
    pub fn emitter_settings(&self, kind: &str, thread_id: &str) -> EmitterSettings {
        let streaming = &self.settings.streaming;
        EmitterSettings {
            flow: kind.to_string(),
            thread_id: thread_id.to_string(),
            snapshot_throttle: Duration::from_secs(streaming.snapshot_throttle_interval),
            long_task_threshold: Duration::from_secs(streaming.long_running_task_threshold),
            keepalive: Duration::from_secs(streaming.report_keepalive_interval),
            tracked_nodes: self.flows.tracked_nodes(kind),
            tool_node_names: self.flows.services().tools.node_name_map(),
        }
    }

    /// Run configuration for one thread.
    pub fn run_config(&self, thread_id: &str, context: Value) -> RunConfig {
        RunConfig::new(thread_id)
            .with_recursion_limit(self.settings.limits.graph_recursion_limit)
            .with_cancel(self.cancel.flag(thread_id))
            .with_context(context)
    }

    /// Launch a run and return its envelope stream.
    pub fn start_stream(
        &self,
        kind: &str,
        flow: Arc<CompiledFlow>,
        thread_id: &str,
        input: Option<Value>,
        checkpoint_id: Option<String>,
        context: Value,
    ) -> impl Stream<Item = Envelope> + Send {
        let mut config = self.run_config(thread_id, context);
        if let Some(id) = checkpoint_id {
            config = config.with_checkpoint_id(id);
        }
        let cancel = Arc::clone(&config.cancel);
        let rx = flow.stream(input, config);
        let emitter = EventEmitter::new(
            self.emitter_settings(kind, thread_id),
            flow,
            cancel,
            Arc::clone(self.gateway.metrics()),
        );
        emitter.into_stream(rx)
    }
}
