//! In-memory checkpoint store.
//!
//! `Arc<RwLock<HashMap>>`-backed implementation of [`CheckpointStore`] used
//! by tests and single-process local runs. Checkpoints per thread are kept in
//! insertion order, so the newest entry is the resume point.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::store::CheckpointStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct ThreadCheckpoints {
    checkpoints: Vec<Checkpoint>,
    writes: Vec<(String, String, Vec<(String, Value)>)>,
}

/// In-memory [`CheckpointStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    storage: Arc<RwLock<HashMap<String, ThreadCheckpoints>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one checkpoint.
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of stored checkpoints across all threads.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|t| t.checkpoints.len())
            .sum()
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut storage = self.storage.write().await;
        let entry = storage.entry(thread_id.to_string()).or_default();
        // Re-putting an id replaces the stored record in place.
        if let Some(existing) = entry.checkpoints.iter_mut().find(|c| c.id == checkpoint.id) {
            *existing = checkpoint.clone();
        } else {
            entry.checkpoints.push(checkpoint.clone());
        }
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(thread_id)
            .and_then(|t| t.checkpoints.last().cloned()))
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage.get(thread_id).and_then(|t| {
            t.checkpoints
                .iter()
                .find(|c| c.id == checkpoint_id)
                .cloned()
        }))
    }

    async fn list_ancestry(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let storage = self.storage.read().await;
        let Some(thread) = storage.get(thread_id) else {
            return Ok(Vec::new());
        };
        let by_id: HashMap<&str, &Checkpoint> = thread
            .checkpoints
            .iter()
            .map(|c| (c.id.as_str(), c))
            .collect();
        let mut chain = Vec::new();
        let mut cursor = thread.checkpoints.last();
        while let Some(checkpoint) = cursor {
            chain.push(checkpoint.clone());
            cursor = checkpoint
                .parent_id
                .as_deref()
                .and_then(|id| by_id.get(id).copied());
        }
        Ok(chain)
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let entry = storage.entry(thread_id.to_string()).or_default();
        entry
            .writes
            .push((checkpoint_id.to_string(), task_id.to_string(), writes));
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}
