//! Storage backend trait for checkpoint persistence.
//!
//! Implementations must support concurrent readers and a single writer per
//! thread id. Each thread's checkpoints form a tree; the newest checkpoint is
//! the resume point returned by [`CheckpointStore::get_latest`].

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Backend for persisting graph checkpoints.
///
/// The graph runtime calls [`put`](Self::put) after every super-step and
/// [`get_latest`](Self::get_latest) when resuming a thread. HTTP surfaces use
/// [`get`](Self::get) and [`list_ancestry`](Self::list_ancestry) for snapshot
/// listing and time-travel restore.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist one checkpoint. Atomic: either the whole record (including
    /// extracted blobs) is visible afterwards, or nothing is.
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// The newest checkpoint for a thread, or `None` for an unknown thread.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// A specific checkpoint by id.
    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>>;

    /// The ancestry chain of the newest checkpoint, newest first, ending at
    /// the root.
    async fn list_ancestry(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Record intermediate writes produced inside a super-step, keyed by the
    /// task that produced them.
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<()>;

    /// Remove every checkpoint, write, and blob belonging to a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
