//! Graph structure and builder.
//!
//! Nodes are async functions `(input, context) -> NodeResult`. Edges are
//! either direct (`src -> dst`) or conditional: a router inspects the
//! post-step state and the node's output and returns a [`Route`], which may
//! fan out dispatch tasks. [`FlowBuilder`] assembles and validates the
//! structure; [`FlowBuilder::compile`] produces an executable
//! [`CompiledFlow`](crate::runtime::CompiledFlow).

use crate::dispatch::{NodeResult, Route};
use crate::error::{GraphError, Result};
use crate::events::EventSink;
use crate::runtime::{CancelFlag, CompiledFlow};
use crate::state::StateSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Node identifier.
pub type NodeId = String;

/// Virtual entry node.
pub const START: &str = "__start__";

/// Virtual exit node.
pub const END: &str = "__end__";

/// Per-invocation context handed to node executors.
///
/// Carries the identity of this invocation (`run_id` is unique per instance,
/// also across parallel instances of one node), the event sink for streaming,
/// the cancellation flag, and an opaque flow-level configuration value.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Thread this run belongs to.
    pub thread_id: String,
    /// Unique id of this invocation instance.
    pub run_id: String,
    /// Node name.
    pub node: String,
    /// Sink for LLM/tool events produced inside the node.
    pub events: EventSink,
    /// Cooperative cancellation flag for the whole thread.
    pub cancel: CancelFlag,
    /// Flow-level configuration passthrough (model overrides etc.).
    pub config: Value,
}

/// Boxed future returned by node executors.
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<NodeResult>> + Send>>;

/// Async node function.
pub type NodeExecutor = Arc<dyn Fn(Value, NodeContext) -> NodeFuture + Send + Sync>;

/// Conditional edge router: `(state, node_output) -> Route`.
pub type RouterFn = Arc<dyn Fn(&Value, &Value) -> Route + Send + Sync>;

/// A node definition.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    pub executor: NodeExecutor,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("executor", &"<fn>")
            .finish()
    }
}

/// A transition out of a node.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional transition.
    Direct(NodeId),
    /// Router-driven transition; `branches` lists the possible targets for
    /// validation and introspection.
    Conditional {
        router: RouterFn,
        branches: HashMap<String, NodeId>,
    },
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(to) => f.debug_tuple("Direct").field(to).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("router", &"<fn>")
                .field("branches", branches)
                .finish(),
        }
    }
}

/// Builder for flow graphs.
pub struct FlowBuilder {
    name: String,
    nodes: HashMap<NodeId, NodeSpec>,
    edges: HashMap<NodeId, Vec<Edge>>,
    dispatch_edges: Vec<(NodeId, NodeId)>,
    schema: StateSchema,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            dispatch_edges: Vec::new(),
            schema: StateSchema::new(),
        }
    }

    /// Declare the state schema (field reducers) for this flow.
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Add a node from an async closure.
    pub fn add_node<F, Fut>(mut self, name: impl Into<String>, executor: F) -> Self
    where
        F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeResult>> + Send + 'static,
    {
        let name = name.into();
        let spec = NodeSpec {
            name: name.clone(),
            executor: Arc::new(move |input, ctx| Box::pin(executor(input, ctx))),
        };
        self.nodes.insert(name, spec);
        self
    }

    /// Add a direct edge. Use [`START`] / [`END`] for the boundaries.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Direct(to.into()));
        self
    }

    /// Add a conditional edge with its possible targets.
    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        router: F,
        branches: HashMap<String, NodeId>,
    ) -> Self
    where
        F: Fn(&Value, &Value) -> Route + Send + Sync + 'static,
    {
        self.edges.entry(from.into()).or_default().push(Edge::Conditional {
            router: Arc::new(router),
            branches,
        });
        self
    }

    /// Declare a dispatch fan-out relationship for introspection. Dispatch
    /// targets are scheduled by node results or routers at runtime; this
    /// records the edge so graph-structure queries can surface it.
    pub fn declare_dispatch(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.dispatch_edges.push((from.into(), to.into()));
        self
    }

    /// Structural validation: every edge endpoint must exist.
    pub fn validate(&self) -> Result<()> {
        if !self.edges.contains_key(START) {
            return Err(GraphError::Validation(format!(
                "flow '{}' has no edge out of {START}",
                self.name
            )));
        }
        for (from, edges) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' does not exist"
                )));
            }
            for edge in edges {
                match edge {
                    Edge::Direct(to) => {
                        if to != END && !self.nodes.contains_key(to) {
                            return Err(GraphError::Validation(format!(
                                "edge target '{to}' does not exist"
                            )));
                        }
                    }
                    Edge::Conditional { branches, .. } => {
                        for to in branches.values() {
                            if to != END && !self.nodes.contains_key(to) {
                                return Err(GraphError::Validation(format!(
                                    "branch target '{to}' does not exist"
                                )));
                            }
                        }
                    }
                }
            }
        }
        for (from, to) in &self.dispatch_edges {
            if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
                return Err(GraphError::Validation(format!(
                    "dispatch edge '{from}' -> '{to}' references a missing node"
                )));
            }
        }
        Ok(())
    }

    /// Validate and produce an executable flow.
    pub fn compile(self) -> Result<CompiledFlow> {
        self.validate()?;
        Ok(CompiledFlow::from_parts(
            self.name,
            self.nodes,
            self.edges,
            self.dispatch_edges,
            self.schema,
        ))
    }
}
