//! Checkpoint persistence for flowgraph executions
//!
//! A checkpoint is a snapshot of graph state written after every super-step.
//! Checkpoints for one thread form a tree linked by parent pointers; the most
//! recent checkpoint is the resume point. This crate provides:
//!
//! - [`Checkpoint`] / [`TaskDescriptor`] - the persisted record shapes
//! - [`CheckpointStore`] - the storage backend trait
//! - [`InMemoryStore`] - `HashMap`-backed store for tests and local runs
//! - [`SqlCheckpointStore`] - relational store over three tables
//!   (`checkpoints`, `checkpoint_writes`, `checkpoint_blobs`)
//! - [`ValueSerializer`] - pluggable value encoding (JSON or tagged binary)

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod sql;
pub mod store;

pub use checkpoint::{Checkpoint, TaskDescriptor};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryStore;
pub use serializer::{JsonSerializer, TaggedBinarySerializer, ValueSerializer};
pub use sql::SqlCheckpointStore;
pub use store::CheckpointStore;
