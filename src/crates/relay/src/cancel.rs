//! Process-wide cancellation bus.
//!
//! One flag per thread id. Starting a run resets the flag and hands the same
//! `Arc` to the runtime and the emitter; `/stop` sets it. Cancellation is
//! cooperative and idempotent: running nodes finish, nothing new is
//! scheduled.

use dashmap::DashMap;
use flowgraph_core::CancelFlag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Concurrent map of thread id to cancellation flag.
#[derive(Debug, Default)]
pub struct CancelBus {
    flags: DashMap<String, CancelFlag>,
}

impl CancelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag for a thread, created on first use.
    pub fn flag(&self, thread_id: &str) -> CancelFlag {
        self.flags
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Set the cancelled flag. Idempotent.
    pub fn cancel(&self, thread_id: &str) {
        self.flag(thread_id).store(true, Ordering::Relaxed);
    }

    /// Read the flag without creating it.
    pub fn is_cancelled(&self, thread_id: &str) -> bool {
        self.flags
            .get(thread_id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Clear the flag at the start of a run.
    pub fn reset(&self, thread_id: &str) {
        self.flag(thread_id).store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_and_reset_clears() {
        let bus = CancelBus::new();
        assert!(!bus.is_cancelled("t1"));
        bus.cancel("t1");
        assert!(bus.is_cancelled("t1"));
        bus.cancel("t1");
        assert!(bus.is_cancelled("t1"));
        bus.reset("t1");
        assert!(!bus.is_cancelled("t1"));
    }

    #[test]
    fn flags_are_shared_handles() {
        let bus = CancelBus::new();
        let handle = bus.flag("t1");
        bus.cancel("t1");
        assert!(handle.load(Ordering::Relaxed));
    }

    #[test]
    fn threads_are_independent() {
        let bus = CancelBus::new();
        bus.cancel("t1");
        assert!(!bus.is_cancelled("t2"));
    }
}
