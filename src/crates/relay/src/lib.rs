//! relay - multi-tenant LLM agent orchestration service
//!
//! Two workflows per request: an interactive chat agent and a long-running
//! report generator, both running over the checkpointed flowgraph runtime.
//! Clients connect over HTTP, authenticate per user, and receive a live SSE
//! stream of graph progress, model tokens, tool calls, and sequenced state
//! snapshots that survive reconnects.

pub mod api;
pub mod auth;
pub mod authz;
pub mod cancel;
pub mod config;
pub mod emitter;
pub mod error;
pub mod flows;
pub mod prompts;
pub mod render;
pub mod state;
pub mod threads;
pub mod tools;

pub use error::{RelayError, Result};
pub use state::AppState;
