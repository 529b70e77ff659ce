//! HTTP/SSE surface.

pub mod chat;
pub mod graph;
pub mod report;
pub mod routes;
pub mod sse;
pub mod threads;

pub use routes::create_router;
