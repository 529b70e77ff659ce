//! Error types for graph construction and execution.

use thiserror::Error;

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or running a flow graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Graph structure is invalid (unknown edge target, missing entry, ...).
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node's executor returned an error.
    #[error("node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Node that failed.
        node: String,
        /// Error message from the executor.
        error: String,
    },

    /// Execution failure without a specific node context.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The configured super-step budget was exhausted.
    #[error("recursion limit of {limit} super-steps exceeded")]
    RecursionLimit {
        /// Configured limit.
        limit: usize,
    },

    /// The run was cancelled before completion.
    #[error("execution cancelled")]
    Cancelled,

    /// A state reducer rejected an update.
    #[error(transparent)]
    State(#[from] crate::state::StateError),

    /// Checkpoint persistence failed.
    #[error(transparent)]
    Checkpoint(#[from] flowgraph_checkpoint::CheckpointError),

    /// State could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    /// Shorthand for [`GraphError::NodeExecution`].
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        GraphError::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}
