//! Listener chain of a transactional reference
//!
//! Blocked transactions push `(latch, era)` nodes onto the chain of every
//! reference they read. A committer detaches the whole chain with one swap
//! after publishing its value and opens every latch on it. Pushers pop
//! stale nodes off the head first, so a reference that is never written
//! does not collect the listeners of every transaction that gave up on it.
//!
//! ## Memory Safety
//! Nodes are reclaimed with crossbeam-epoch:
//! - Pushers pin the current epoch while they CAS the head
//! - The detaching committer owns the detached nodes and defers their
//!   destruction until every pinned pusher has moved on

use crate::latch::Latch;
use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct ListenerNode {
    latch: Arc<Latch>,
    era: u64,
    next: Atomic<ListenerNode>,
}

/// Lock-free stack of wakeup handles
pub struct ListenerChain {
    head: Atomic<ListenerNode>,
}

impl ListenerChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Register `latch` to be opened (in `era`) by the next detaching commit
    pub fn push(&self, latch: Arc<Latch>, era: u64) {
        let guard = epoch::pin();
        self.prune_stale_head(&guard);
        let mut node = Owned::new(ListenerNode {
            latch,
            era,
            next: Atomic::null(),
        });

        loop {
            let head = self.head.load(Ordering::SeqCst, &guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::SeqCst, Ordering::SeqCst, &guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    /// Pop nodes off the head whose latch was opened or moved to a later era
    fn prune_stale_head(&self, guard: &epoch::Guard) {
        let mut head = self.head.load(Ordering::SeqCst, guard);
        // SAFETY: nodes reachable from the head are only destroyed through
        // `defer_destroy`, which waits for this pinned guard
        while let Some(node) = unsafe { head.as_ref() } {
            if !node.latch.is_open_in(node.era) {
                return;
            }
            let next = node.next.load(Ordering::Acquire, guard);
            match self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst, guard)
            {
                Ok(_) => {
                    // SAFETY: the CAS unlinked the node; nobody can reach it
                    // from the chain anymore
                    unsafe { guard.defer_destroy(head) };
                    head = next;
                }
                Err(e) => head = e.current,
            }
        }
    }

    /// True if nobody is registered
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::SeqCst, &guard).is_null()
    }

    /// Take every registered listener, leaving the chain empty
    ///
    /// Returns `None` if the chain was empty.
    pub fn detach(&self) -> Option<Listeners> {
        let guard = epoch::pin();
        let mut current = self.head.swap(Shared::null(), Ordering::SeqCst, &guard);
        if current.is_null() {
            return None;
        }

        let mut listeners = Listeners::default();
        while let Some(node) = unsafe { current.as_ref() } {
            listeners.entries.push((Arc::clone(&node.latch), node.era));
            let next = node.next.load(Ordering::Acquire, &guard);
            // SAFETY: the swap unlinked the whole chain; we are its only owner
            unsafe { guard.defer_destroy(current) };
            current = next;
        }
        Some(listeners)
    }
}

impl Default for ListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenerChain {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no other thread can reach the chain
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let node = current.into_owned();
                current = node.next.load(Ordering::Relaxed, guard);
            }
        }
    }
}

impl std::fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerChain")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Listeners detached from a chain, waiting to be opened
#[derive(Debug, Default)]
pub struct Listeners {
    entries: SmallVec<[(Arc<Latch>, u64); 4]>,
}

impl Listeners {
    /// Number of detached listeners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was detached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the listeners of `other` into `self`
    pub fn append(&mut self, other: Listeners) {
        self.entries.extend(other.entries);
    }

    /// Open every latch in the era it was registered for
    pub fn open_all(self) {
        for (latch, era) in self.entries {
            latch.open(era);
        }
    }
}
