//! Tagged dispatch messages and node results.
//!
//! A node schedules successors by embedding [`DispatchMessage`]s in its
//! return value: a list of messages fans out one parallel child task per
//! message, each with its own payload and a fresh run id assigned by the
//! runtime. Conditional edges return a [`Route`], which may itself dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tagged value scheduling one child task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// Target node to run.
    pub node: String,
    /// Payload handed to the target as its input.
    pub input: Value,
}

impl DispatchMessage {
    pub fn new(node: impl Into<String>, input: Value) -> Self {
        Self {
            node: node.into(),
            input,
        }
    }
}

/// What a node produced: a state delta, a fan-out, or both.
#[derive(Debug, Clone)]
pub enum NodeResult {
    /// State delta merged through the flow's reducers.
    Update(Value),
    /// Parallel fan-out; no state change.
    Dispatch(Vec<DispatchMessage>),
    /// State delta plus fan-out in one return.
    Mixed {
        update: Value,
        dispatches: Vec<DispatchMessage>,
    },
}

impl NodeResult {
    /// Empty update.
    pub fn none() -> Self {
        NodeResult::Update(Value::Null)
    }

    /// The state delta, if any.
    pub fn update(&self) -> Option<&Value> {
        match self {
            NodeResult::Update(update) | NodeResult::Mixed { update, .. } => Some(update),
            NodeResult::Dispatch(_) => None,
        }
    }

    /// The dispatch messages, possibly empty.
    pub fn dispatches(&self) -> &[DispatchMessage] {
        match self {
            NodeResult::Update(_) => &[],
            NodeResult::Dispatch(dispatches) | NodeResult::Mixed { dispatches, .. } => dispatches,
        }
    }
}

/// Decision of a conditional edge router.
#[derive(Debug, Clone)]
pub enum Route {
    /// Proceed to a single node (use [`crate::graph::END`] to terminate).
    To(String),
    /// Fan out child tasks.
    Dispatch(Vec<DispatchMessage>),
    /// Terminate this branch.
    End,
}
