//! Flow definitions and registry.
//!
//! Two flows are compiled at boot: `chat` (agent ⇄ tools loop) and `report`
//! (splitter → analyst fan-out → batch processor → editor). A third,
//! uncheckpointed chat graph backs the `consult_general_knowledge` tool the
//! report analysts use, governed by the `consult` pool.

pub mod chat;
pub mod report;

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::prompts::PromptLoader;
use crate::tools::{Tool, ToolContext, ToolRegistry};
use async_trait::async_trait;
use flowgraph_checkpoint::CheckpointStore;
use flowgraph_core::{messages_from_value, CompiledFlow, GraphError, Message, MessageRole, RunConfig};
use llm_gateway::{ModelGateway, ToolSchema};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Short flow kinds used in envelopes and routes.
pub const FLOW_CHAT: &str = "chat";
pub const FLOW_REPORT: &str = "report";

/// Tool name of the chat-subgraph consult.
pub const CONSULT_TOOL: &str = "consult_general_knowledge";

/// Tools bound to report analysts, in binding order.
pub const ANALYST_TOOLS: &[&str] = &[CONSULT_TOOL, "get_procedure", "get_regelgeving"];

/// Shared dependencies handed to every node closure.
pub struct FlowServices {
    pub settings: Arc<Settings>,
    pub gateway: Arc<ModelGateway>,
    pub tools: ToolRegistry,
    pub prompts: Arc<PromptLoader>,
}

impl FlowServices {
    /// Tool schemas bound to the chat agent: everything registered except
    /// the consult tool (a chat agent consulting itself recurses).
    pub fn chat_tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .all_schemas()
            .into_iter()
            .filter(|schema| schema.name != CONSULT_TOOL)
            .collect()
    }

    /// Tool schemas bound to report analysts.
    pub fn analyst_tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools.schemas(ANALYST_TOOLS)
    }
}

/// Invokes the consult chat graph as a sub-call.
struct ConsultTool {
    flow: Arc<CompiledFlow>,
}

#[async_trait]
impl Tool for ConsultTool {
    fn name(&self) -> &str {
        CONSULT_TOOL
    }

    fn description(&self) -> &str {
        "Raadpleeg de algemene kennisassistent met een vrije vraag."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "De vraag voor de assistent."}
            },
            "required": ["question"]
        })
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let question = args["question"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'question' argument"))?;
        let config = RunConfig::new(format!("{}::consult::{}", ctx.thread_id, ctx.run_id));
        let final_state = self
            .flow
            .invoke(
                Some(json!({"messages": [Message::human(question)]})),
                &config,
            )
            .await
            .map_err(|e| anyhow::anyhow!("consult sub-flow failed: {e}"))?;
        let messages = messages_from_value(&final_state["messages"])
            .map_err(|e| anyhow::anyhow!("consult produced unreadable state: {e}"))?;
        messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Ai)
            .map(|m| m.content.clone())
            .ok_or_else(|| anyhow::anyhow!("consult produced no answer"))
    }
}

/// Compiled flows plus the per-flow metadata the surfaces need.
pub struct FlowRegistry {
    flows: HashMap<&'static str, Arc<CompiledFlow>>,
    tracked: HashMap<&'static str, HashSet<String>>,
    services: Arc<FlowServices>,
}

impl FlowRegistry {
    /// Compile all flows against the given dependencies.
    pub fn build(
        settings: Arc<Settings>,
        gateway: Arc<ModelGateway>,
        base_tools: ToolRegistry,
        prompts: Arc<PromptLoader>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        // The consult subgraph binds the base tools only and runs without a
        // checkpointer; its calls go through the consult pool.
        let consult_services = Arc::new(FlowServices {
            settings: Arc::clone(&settings),
            gateway: Arc::clone(&gateway),
            tools: base_tools.clone(),
            prompts: Arc::clone(&prompts),
        });
        let consult_model = settings.flows.consult_model.clone();
        let consult_flow = Arc::new(
            chat::build_chat_flow(consult_services, "consult", &consult_model)
                .map_err(graph_to_relay)?,
        );

        let mut tools = base_tools;
        tools.register(Arc::new(ConsultTool { flow: consult_flow }));

        let services = Arc::new(FlowServices {
            settings: Arc::clone(&settings),
            gateway,
            tools,
            prompts,
        });

        let chat_model = settings.flows.chat_model.clone();
        let chat_flow = chat::build_chat_flow(Arc::clone(&services), "agent", &chat_model)
            .map_err(graph_to_relay)?
            .with_checkpointer(Arc::clone(&checkpoints));
        let report_flow = report::build_report_flow(Arc::clone(&services))
            .map_err(graph_to_relay)?
            .with_checkpointer(checkpoints);

        let mut flows = HashMap::new();
        flows.insert(FLOW_CHAT, Arc::new(chat_flow));
        flows.insert(FLOW_REPORT, Arc::new(report_flow));

        let mut tracked = HashMap::new();
        tracked.insert(
            FLOW_CHAT,
            HashSet::from([chat::AGENT_NODE.to_string(), chat::TOOLS_NODE.to_string()]),
        );
        tracked.insert(
            FLOW_REPORT,
            HashSet::from([
                report::SPLITTER_NODE.to_string(),
                report::ANALYST_NODE.to_string(),
                report::BATCH_PROCESSOR_NODE.to_string(),
                report::BATCH_PROCESSOR_NOOP_NODE.to_string(),
                report::EDITOR_NODE.to_string(),
            ]),
        );

        Ok(Self {
            flows,
            tracked,
            services,
        })
    }

    pub fn get(&self, kind: &str) -> Result<Arc<CompiledFlow>> {
        self.flows
            .get(kind)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("unknown flow: {kind}")))
    }

    /// Nodes the emitter tracks for this flow.
    pub fn tracked_nodes(&self, kind: &str) -> HashSet<String> {
        self.tracked.get(kind).cloned().unwrap_or_default()
    }

    /// Map a full flow tag (`org.project.flow`) to a flow kind.
    pub fn kind_for_tag(&self, tag: &str) -> Option<&'static str> {
        if tag == self.services.settings.flows.chat_flow_tag {
            Some(FLOW_CHAT)
        } else if tag == self.services.settings.flows.report_flow_tag {
            Some(FLOW_REPORT)
        } else {
            None
        }
    }

    /// Full flow tag for a kind.
    pub fn tag_for_kind(&self, kind: &str) -> Option<String> {
        match kind {
            FLOW_CHAT => Some(self.services.settings.flows.chat_flow_tag.clone()),
            FLOW_REPORT => Some(self.services.settings.flows.report_flow_tag.clone()),
            _ => None,
        }
    }

    pub fn services(&self) -> &Arc<FlowServices> {
        &self.services
    }
}

fn graph_to_relay(err: GraphError) -> RelayError {
    RelayError::Internal(err.to_string())
}
