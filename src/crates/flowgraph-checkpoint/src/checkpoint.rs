//! Checkpoint record shapes.
//!
//! A [`Checkpoint`] captures the complete graph state after one super-step:
//! the full channel-value map, the nodes scheduled for the next step, and the
//! in-flight dispatch tasks. Checkpoints link to their predecessor through
//! `parent_id`, forming a tree per thread whose newest entry is the resume
//! point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One scheduled invocation of a node, as persisted in a checkpoint.
///
/// `run_id` identifies exactly one invocation instance; parallel instances of
/// the same node carry distinct run ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique id of this invocation instance.
    pub run_id: String,
    /// Node scheduled to run.
    pub node: String,
    /// Input payload handed to the node (full state for plain edges, the
    /// dispatch payload for fan-out tasks).
    pub input: Value,
}

impl TaskDescriptor {
    pub fn new(node: impl Into<String>, input: Value) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            node: node.into(),
            input,
        }
    }
}

/// A persisted snapshot of graph state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: String,
    /// Id of the checkpoint this one descends from; `None` for the root.
    pub parent_id: Option<String>,
    /// Full serialized graph state, keyed by state field.
    pub values: Map<String, Value>,
    /// Ordered set of nodes scheduled for the next super-step.
    pub next_nodes: Vec<String>,
    /// In-flight dispatch tasks for the next super-step.
    pub tasks: Vec<TaskDescriptor>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id.
    pub fn new(
        parent_id: Option<String>,
        values: Map<String, Value>,
        next_nodes: Vec<String>,
        tasks: Vec<TaskDescriptor>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            values,
            next_nodes,
            tasks,
            created_at: Utc::now(),
        }
    }

    /// A root checkpoint holding only initial state.
    pub fn root(values: Map<String, Value>, next_nodes: Vec<String>, tasks: Vec<TaskDescriptor>) -> Self {
        Self::new(None, values, next_nodes, tasks)
    }

    /// Whether this checkpoint has nothing left to schedule.
    pub fn is_terminal(&self) -> bool {
        self.next_nodes.is_empty() && self.tasks.is_empty()
    }
}
