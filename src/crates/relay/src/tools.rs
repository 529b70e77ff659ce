//! Tool trait and registry.
//!
//! Domain tools (vector search, document lookup, web scraping, ...) are
//! external collaborators: opaque async functions `(args, ctx) -> result`.
//! The registry maps tool names to implementations plus the logical
//! tool-node name shown in the event stream. Unknown or failing tools never
//! raise into the graph; they produce an `"Error: ..."` string so the model
//! can recover on its next turn.

use crate::auth::Principal;
use llm_gateway::ToolSchema;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Call-site context handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub thread_id: String,
    pub run_id: String,
    /// Caller identity, when the surface knows it.
    pub principal: Option<Principal>,
}

impl ToolContext {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            principal: None,
        }
    }
}

/// An opaque domain tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Named collection of tools with logical node names for the event stream.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    node_names: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register a tool under an explicit logical node name.
    pub fn register_with_node_name(&mut self, tool: Arc<dyn Tool>, node_name: impl Into<String>) {
        self.node_names
            .insert(tool.name().to_string(), node_name.into());
        self.register(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Logical node name a tool appears under in the stream.
    pub fn node_name_for(&self, tool_name: &str) -> String {
        self.node_names
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| tool_name.to_string())
    }

    /// Mapping used by the event emitter.
    pub fn node_name_map(&self) -> HashMap<String, String> {
        self.tools
            .keys()
            .map(|name| (name.clone(), self.node_name_for(name)))
            .collect()
    }

    /// Schemas for a subset of tools, in the given order. Unknown names are
    /// skipped.
    pub fn schemas(&self, names: &[&str]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Schemas for every registered tool, name-sorted.
    pub fn all_schemas(&self) -> Vec<ToolSchema> {
        let names = self.names();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.schemas(&refs)
    }

    /// Invoke a tool, converting every failure into an `"Error: ..."` result
    /// string.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, thread_id = %ctx.thread_id, "unknown tool requested");
            return format!("Error: unknown tool '{name}'");
        };
        match tool.call(args, ctx).await {
            Ok(result) => result,
            Err(error) => {
                warn!(tool = name, thread_id = %ctx.thread_id, %error, "tool call failed");
                format!("Error: {error}")
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            anyhow::bail!("backend unavailable")
        }
    }

    #[tokio::test]
    async fn dispatch_runs_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let ctx = ToolContext::new("t1", "r1");
        let result = registry.dispatch("echo", json!({"text": "hoi"}), &ctx).await;
        assert_eq!(result, "hoi");
    }

    #[tokio::test]
    async fn failures_become_error_strings() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));
        let ctx = ToolContext::new("t1", "r1");
        let result = registry.dispatch("broken", json!({}), &ctx).await;
        assert_eq!(result, "Error: backend unavailable");
        let result = registry.dispatch("missing", json!({}), &ctx).await;
        assert!(result.starts_with("Error: unknown tool"));
    }

    #[test]
    fn node_names_default_to_tool_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register_with_node_name(Arc::new(FailingTool), "kennisbank");
        assert_eq!(registry.node_name_for("echo"), "echo");
        assert_eq!(registry.node_name_for("broken"), "kennisbank");
    }
}
