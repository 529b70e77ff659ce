//! Concurrency pools and strict-model request spacing.
//!
//! Pools are named semaphores (`analyst`, `consult`, `agent`) sized from
//! configuration; acquiring blocks until a slot frees up. The
//! [`RequestSpacer`] serializes calls to strict models so that consecutive
//! request starts are at least the model's minimum interval apart - a
//! per-process RPM gate on top of whatever the vendor enforces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Registry of named concurrency pools.
#[derive(Debug, Clone, Default)]
pub struct PoolSemaphores {
    pools: HashMap<String, Arc<Semaphore>>,
}

impl PoolSemaphores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool with a permit count.
    pub fn pool(mut self, name: impl Into<String>, permits: usize) -> Self {
        self.pools
            .insert(name.into(), Arc::new(Semaphore::new(permits)));
        self
    }

    /// Acquire a slot in the named pool. Unknown pools (and `None`) are
    /// unlimited and return no permit.
    pub async fn acquire(&self, pool: Option<&str>) -> Option<OwnedSemaphorePermit> {
        let semaphore = pool.and_then(|name| self.pools.get(name))?.clone();
        debug!(pool = pool.unwrap_or_default(), "acquiring pool permit");
        // acquire_owned only fails when the semaphore is closed, which never
        // happens here.
        semaphore.acquire_owned().await.ok()
    }

    /// Available permits in a pool, for introspection.
    pub fn available(&self, pool: &str) -> Option<usize> {
        self.pools.get(pool).map(|s| s.available_permits())
    }
}

#[derive(Debug, Default)]
struct ModelSlot {
    last_start: Option<Instant>,
}

/// Enforces a minimum interval between request starts per model.
///
/// Callers of the same model queue on that model's mutex; holding it across
/// the sleep is what guarantees the gap between consecutive starts.
#[derive(Debug, Default)]
pub struct RequestSpacer {
    slots: parking_lot::Mutex<HashMap<String, Arc<Mutex<ModelSlot>>>>,
}

impl RequestSpacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until this model's next request may start, then claim the slot.
    pub async fn wait_turn(&self, model: &str, min_interval: Duration) {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(model.to_string()).or_default())
        };
        let mut slot = slot.lock().await;
        if let Some(last) = slot.last_start {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait = min_interval - elapsed;
                debug!(model, wait_ms = wait.as_millis() as u64, "spacing strict-model request");
                tokio::time::sleep(wait).await;
            }
        }
        slot.last_start = Some(Instant::now());
    }
}
