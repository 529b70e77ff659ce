//! The chat flow: `START → agent → (tools → agent)* → END`.
//!
//! The agent node streams its completion so clients get token-level
//! `content_chunk` events; every tool call on the returned `ai` message is
//! answered in order by the tools node before control returns to the agent.

use super::FlowServices;
use crate::tools::ToolContext;
use flowgraph_core::{
    messages_from_value, ExecEvent, FlowBuilder, CompiledFlow, GraphError, Message, MessageRole,
    NodeContext, NodeResult, Route, StateSchema, END, START,
};
use futures::StreamExt;
use llm_gateway::CallContext;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const AGENT_NODE: &str = "agent";
pub const TOOLS_NODE: &str = "tools";

const DEFAULT_SYSTEM_PROMPT: &str = "Je bent een behulpzame assistent voor medewerkers van \
Opgroeien. Antwoord beknopt en in het Nederlands. Gebruik de beschikbare tools om procedures \
en regelgeving op te zoeken voor je antwoordt.";

/// Build the chat flow. `pool` selects the gateway concurrency pool
/// (`agent` for the interactive flow, `consult` for the report sub-call).
pub fn build_chat_flow(
    services: Arc<FlowServices>,
    pool: &str,
    model: &str,
) -> Result<CompiledFlow, GraphError> {
    let schema = StateSchema::new().append_field("messages");

    let agent_services = Arc::clone(&services);
    let agent_pool = pool.to_string();
    let agent_model = model.to_string();
    let tools_services = services;

    let branches = HashMap::from([
        ("tools".to_string(), TOOLS_NODE.to_string()),
        ("end".to_string(), END.to_string()),
    ]);

    FlowBuilder::new("chat")
        .with_schema(schema)
        .add_node(AGENT_NODE, move |input, ctx| {
            let services = Arc::clone(&agent_services);
            let pool = agent_pool.clone();
            let model = agent_model.clone();
            async move { agent_node(services, pool, model, input, ctx).await }
        })
        .add_node(TOOLS_NODE, move |input, ctx| {
            let services = Arc::clone(&tools_services);
            async move { tools_node(services, input, ctx).await }
        })
        .add_edge(START, AGENT_NODE)
        .add_conditional_edge(AGENT_NODE, agent_router, branches)
        .add_edge(TOOLS_NODE, AGENT_NODE)
        .compile()
}

/// Route to the tools node when the fresh `ai` message requested tool calls.
fn agent_router(_state: &Value, output: &Value) -> Route {
    let has_tool_calls = output["messages"]
        .as_array()
        .and_then(|msgs| msgs.last())
        .and_then(|msg| msg.get("tool_calls"))
        .and_then(|calls| calls.as_array())
        .is_some_and(|calls| !calls.is_empty());
    if has_tool_calls {
        Route::To(TOOLS_NODE.to_string())
    } else {
        Route::End
    }
}

async fn agent_node(
    services: Arc<FlowServices>,
    pool: String,
    default_model: String,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let mut messages = messages_from_value(&input["messages"])?;
    if messages.is_empty() {
        return Err(GraphError::node_execution(AGENT_NODE, "empty conversation"));
    }
    if !matches!(messages.first().map(|m| m.role), Some(MessageRole::System)) {
        let prompt = services
            .prompts
            .render("chat_system", &HashMap::new())
            .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());
        messages.insert(0, Message::system(prompt));
    }

    let model = ctx
        .config
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(default_model);
    let request = llm_gateway::ChatRequest::new(&model, messages.clone())
        .with_tools(services.chat_tool_schemas())
        .with_config(services.settings.model_config(&model));

    let call_id = Uuid::new_v4().to_string();
    let call_ctx = CallContext::new(&ctx.thread_id)
        .with_run_id(&ctx.run_id)
        .with_node(AGENT_NODE)
        .with_pool(&pool)
        .with_cancel(Arc::clone(&ctx.cancel))
        .with_call_id(&call_id);

    ctx.events
        .emit(ExecEvent::LlmStart {
            node: AGENT_NODE.to_string(),
            run_id: ctx.run_id.clone(),
            call_id: call_id.clone(),
            model: model.clone(),
            input: json!(messages),
        })
        .await;

    let (_, mut stream) = services
        .gateway
        .stream(&call_ctx, &request)
        .await
        .map_err(|e| GraphError::node_execution(AGENT_NODE, e.to_string()))?;

    let mut accumulated = String::new();
    let mut final_message = None;
    let mut usage = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GraphError::node_execution(AGENT_NODE, e.to_string()))?;
        if !chunk.delta.is_empty() {
            accumulated.push_str(&chunk.delta);
            ctx.events
                .emit(ExecEvent::LlmToken {
                    node: AGENT_NODE.to_string(),
                    run_id: ctx.run_id.clone(),
                    call_id: call_id.clone(),
                    delta: chunk.delta,
                })
                .await;
        }
        if let Some(chunk_usage) = chunk.usage {
            usage = Some(chunk_usage);
        }
        if let Some(message) = chunk.message {
            final_message = Some(message);
        }
    }
    let message = final_message.unwrap_or_else(|| Message::ai(accumulated));

    ctx.events
        .emit(ExecEvent::LlmEnd {
            node: AGENT_NODE.to_string(),
            run_id: ctx.run_id.clone(),
            call_id,
            model,
            input: json!(messages),
            output: json!(message),
            usage: usage.map(|u| json!(u)),
        })
        .await;

    Ok(NodeResult::Update(json!({"messages": [message]})))
}

async fn tools_node(
    services: Arc<FlowServices>,
    input: Value,
    ctx: NodeContext,
) -> Result<NodeResult, GraphError> {
    let messages = messages_from_value(&input["messages"])?;
    let Some(last_ai) = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Ai && m.has_tool_calls())
    else {
        return Ok(NodeResult::none());
    };

    let tool_ctx = ToolContext::new(&ctx.thread_id, &ctx.run_id);
    let mut replies = Vec::with_capacity(last_ai.tool_calls.len());
    for call in &last_ai.tool_calls {
        ctx.events
            .emit(ExecEvent::ToolStart {
                node: TOOLS_NODE.to_string(),
                run_id: ctx.run_id.clone(),
                tool: call.name.clone(),
                args: call.args.clone(),
            })
            .await;
        let started = Instant::now();
        let result = services
            .tools
            .dispatch(&call.name, call.args.clone(), &tool_ctx)
            .await;
        services
            .gateway
            .metrics()
            .record_tool_cost(&ctx.thread_id, started.elapsed(), None);
        ctx.events
            .emit(ExecEvent::ToolEnd {
                node: TOOLS_NODE.to_string(),
                run_id: ctx.run_id.clone(),
                tool: call.name.clone(),
                args: call.args.clone(),
                result: result.clone(),
            })
            .await;
        replies.push(Message::tool(result, &call.call_id));
    }

    Ok(NodeResult::Update(json!({"messages": replies})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_sends_tool_calls_to_tools_node() {
        let with_calls = json!({"messages": [
            {"role": "ai", "content": "", "tool_calls": [
                {"call_id": "c1", "name": "get_procedure", "args": {}}
            ]}
        ]});
        assert!(matches!(
            agent_router(&Value::Null, &with_calls),
            Route::To(node) if node == TOOLS_NODE
        ));
    }

    #[test]
    fn router_ends_without_tool_calls() {
        let plain = json!({"messages": [{"role": "ai", "content": "klaar"}]});
        assert!(matches!(agent_router(&Value::Null, &plain), Route::End));
    }
}
