//! Global and local conflict counters
//!
//! The global counter is bumped by every update commit that may invalidate
//! another transaction's reads, before the commit publishes anything. A transaction keeps a local copy
//! and compares it after each load: an unchanged counter proves that none of
//! its earlier reads can have been overwritten, without scanning them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide epoch of conflicting commits (one per STM instance)
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    counter: AtomicU64,
}

impl GlobalConflictCounter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Record a commit that may conflict with concurrent readers
    ///
    /// Must be called before the first new value of the commit is visible.
    #[inline]
    pub fn signal_conflict(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Current epoch
    #[inline]
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// A transaction's last observed epoch of the global counter
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConflictCounter {
    local: u64,
}

impl LocalConflictCounter {
    /// Snapshot the global counter
    pub fn new(global: &GlobalConflictCounter) -> Self {
        Self {
            local: global.count(),
        }
    }

    /// Resynchronize with the global counter
    #[inline]
    pub fn reset(&mut self, global: &GlobalConflictCounter) {
        self.local = global.count();
    }

    /// Returns true if the global counter moved since the last sync, and syncs
    #[inline]
    pub fn sync_and_check_conflict(&mut self, global: &GlobalConflictCounter) -> bool {
        let current = global.count();
        if current == self.local {
            return false;
        }
        self.local = current;
        true
    }

    /// Last observed epoch
    pub fn get(&self) -> u64 {
        self.local
    }
}
