//! flowgraph-core - checkpointed state-machine graph runtime
//!
//! A flow is a directed graph of named async nodes over a typed state map.
//! Nodes return state deltas merged through per-field reducers, or tagged
//! dispatch messages that fan out parallel child tasks. Execution proceeds in
//! super-steps: every scheduled task runs concurrently, outputs are reduced
//! into state, edges determine the next task set, and a checkpoint is written
//! before the next step begins.
//!
//! ```text
//!   START ──▶ splitter ──▶ [Dispatch(analyst, c₁) … Dispatch(analyst, cₙ)]
//!                               │ (parallel, distinct run_ids)
//!                               ▼
//!                         batch_processor ──▶ editor ──▶ END
//! ```
//!
//! Streaming callers receive [`events::ExecEvent`]s over a bounded channel;
//! the producer blocks when the consumer lags, so no event is dropped.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod messages;
pub mod runtime;
pub mod state;

pub use dispatch::{DispatchMessage, NodeResult, Route};
pub use error::{GraphError, Result};
pub use events::{EventSink, ExecEvent};
pub use graph::{Edge, FlowBuilder, NodeContext, NodeExecutor, END, START};
pub use messages::{messages_from_value, messages_to_value, Message, MessageRole, ToolCall};
pub use runtime::{CancelFlag, CompiledFlow, GraphStructure, RunConfig};
pub use state::{AppendReducer, LastWriteReducer, MergeReducer, Reducer, StateSchema};
