//! Shared state of a transactional reference
//!
//! [`RefCore`] pairs an [`Orec`] with the active committed snapshot and the
//! listener chain. It is the only place where a new value becomes visible.
//!
//! ## Visibility protocol
//!
//! - Readers arrive on the orec, then read `(version, snapshot, version)`
//!   and accept the snapshot only if all three versions agree
//! - Writers hold the commit lock, swap in the new snapshot, bump the
//!   version, unlock, and only then detach the listener chain
//! - The committing transaction signals the global conflict counter before
//!   its first snapshot swap if any reference it publishes has other readers
//! - Retired snapshots are reclaimed through crossbeam-epoch

use crate::latch::Latch;
use crate::listeners::{ListenerChain, Listeners};
use crate::orec::{Arrival, Orec};
use crate::stm::Stm;
use crate::tranlocal::Tranlocal;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_core::types::{LockMode, RefId, StmId, TxnId, INITIAL_VERSION, VERSION_UNCOMMITTED};
use thiserror::Error;

/// Values that can live in a transactional reference
///
/// `PartialEq` drives the dirty check; `Clone` produces the private copy a
/// transaction works on.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> TxnValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Why a load did not produce a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The orec stayed locked for the whole spin budget
    #[error("reference is locked")]
    Locked,
    /// The reference was created in a transaction that never committed
    #[error("reference was never committed")]
    Uncommitted,
}

/// Outcome of registering a change listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The listener is installed and will be opened by the next update
    Done,
    /// The value already changed; the latch was opened immediately
    NotNeeded,
    /// Nothing to wait on (constructed or commuting attachment)
    None,
}

/// A consistent `(value, version)` pair read from a reference
#[derive(Debug)]
pub(crate) struct Loaded<T> {
    pub value: T,
    pub version: u64,
    pub lock_mode: LockMode,
    pub holds_surplus: bool,
}

struct Snapshot<T> {
    value: T,
    version: u64,
}

/// Orec, active snapshot and listeners of one reference
pub struct RefCore<T: TxnValue> {
    id: RefId,
    stm: Stm,
    orec: Orec,
    active: Atomic<Snapshot<T>>,
    listeners: ListenerChain,
}

impl<T: TxnValue> RefCore<T> {
    /// A committed reference holding `value` at [`INITIAL_VERSION`]
    pub(crate) fn new(stm: Stm, value: T) -> Self {
        Self {
            id: RefId::next(),
            stm,
            orec: Orec::new(),
            active: Atomic::new(Snapshot {
                value,
                version: INITIAL_VERSION,
            }),
            listeners: ListenerChain::new(),
        }
    }

    /// A reference commit locked by `owner` until its construction commits
    pub(crate) fn new_constructing(stm: Stm, owner: TxnId, value: T) -> Self {
        Self {
            id: RefId::next(),
            stm,
            orec: Orec::new_constructing(owner),
            active: Atomic::new(Snapshot {
                value,
                version: VERSION_UNCOMMITTED,
            }),
            listeners: ListenerChain::new(),
        }
    }

    /// Identity of this reference
    pub fn id(&self) -> RefId {
        self.id
    }

    /// STM instance that created this reference
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Id of the owning STM instance
    pub fn stm_id(&self) -> StmId {
        self.stm.id()
    }

    /// Ownership record
    pub fn orec(&self) -> &Orec {
        &self.orec
    }

    /// True if a blocked transaction waits on this reference
    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Optimistic read of the active snapshot
    ///
    /// On success the caller holds the arrival reported in
    /// `Loaded::holds_surplus` and must depart later.
    pub(crate) fn load(&self, spin_count: u32) -> Result<Loaded<T>, LoadError> {
        let mut spins = spin_count;
        loop {
            let arrival = self.orec.arrive(spins);
            if arrival == Arrival::LockNotFree {
                return Err(LoadError::Locked);
            }

            let guard = epoch::pin();
            let before = self.orec.version();
            let shared = self.active.load(Ordering::SeqCst, &guard);
            let after = self.orec.version();

            // SAFETY: the active pointer is never null and a retired snapshot
            // is not destroyed while we are pinned
            if let Some(snapshot) = unsafe { shared.as_ref() } {
                if snapshot.version == before && before == after {
                    if before == VERSION_UNCOMMITTED {
                        if arrival.holds_surplus() {
                            self.orec.depart_after_failure();
                        }
                        return Err(LoadError::Uncommitted);
                    }
                    return Ok(Loaded {
                        value: snapshot.value.clone(),
                        version: before,
                        lock_mode: LockMode::None,
                        holds_surplus: arrival.holds_surplus(),
                    });
                }
            }

            // A commit slipped in between; back off and read again
            if arrival.holds_surplus() {
                self.orec.depart_after_failure();
            }
            if spins == 0 {
                return Err(LoadError::Locked);
            }
            spins -= 1;
            std::hint::spin_loop();
        }
    }

    /// Pessimistic read: acquire `lock_mode` and read under the lock
    pub(crate) fn lock_and_load(
        &self,
        spin_count: u32,
        owner: TxnId,
        lock_mode: LockMode,
    ) -> Result<Loaded<T>, LoadError> {
        debug_assert!(lock_mode != LockMode::None);
        let arrival =
            self.orec
                .try_lock_and_arrive(spin_count, lock_mode == LockMode::Commit, owner);
        if arrival == Arrival::LockNotFree {
            return Err(LoadError::Locked);
        }

        let guard = epoch::pin();
        let version = self.orec.version();
        if version == VERSION_UNCOMMITTED {
            self.release_lock(arrival.holds_surplus());
            return Err(LoadError::Uncommitted);
        }

        // SAFETY: see `load`; the lock keeps the snapshot from changing
        match unsafe { self.active.load(Ordering::SeqCst, &guard).as_ref() } {
            Some(snapshot) => Ok(Loaded {
                value: snapshot.value.clone(),
                version,
                lock_mode,
                holds_surplus: arrival.holds_surplus(),
            }),
            None => {
                self.release_lock(arrival.holds_surplus());
                Err(LoadError::Locked)
            }
        }
    }

    /// Give back a load that will not be attached
    pub(crate) fn release_loaded(&self, loaded: &Loaded<T>) {
        if loaded.lock_mode != LockMode::None {
            self.release_lock(loaded.holds_surplus);
        } else if loaded.holds_surplus {
            self.orec.depart_after_failure();
        }
    }

    /// Initial value of a reference `owner` is constructing
    ///
    /// `None` once the reference is committed or if someone else constructs it.
    pub(crate) fn uncommitted_value(&self, owner: TxnId) -> Option<T> {
        if self.orec.version() != VERSION_UNCOMMITTED || self.orec.owner() != Some(owner) {
            return None;
        }
        let guard = epoch::pin();
        // SAFETY: see `load`
        unsafe { self.active.load(Ordering::SeqCst, &guard).as_ref() }
            .map(|snapshot| snapshot.value.clone())
    }

    /// Read the committed value outside of any transaction
    pub(crate) fn atomic_load(&self, spin_count: u32) -> Result<(T, u64), LoadError> {
        let loaded = self.load(spin_count)?;
        if loaded.holds_surplus {
            self.orec.depart_after_reading();
        }
        Ok((loaded.value, loaded.version))
    }

    // ========================================================================
    // Validation and locking
    // ========================================================================

    /// True if the snapshot in `tranlocal` is no longer the active one
    pub(crate) fn has_read_conflict(&self, tranlocal: &Tranlocal<T>) -> bool {
        if tranlocal.lock_mode() != LockMode::None {
            return false;
        }
        if self.orec.is_commit_locked() {
            return true;
        }
        self.orec.version() != tranlocal.version()
    }

    /// Lock an already read reference and check nobody wrote it since
    ///
    /// Returns false on lock contention or if the version moved. A lock that
    /// was acquired stays recorded in the tranlocal so that abort releases it.
    pub(crate) fn try_lock_and_check_conflict(
        &self,
        owner: TxnId,
        spin_count: u32,
        tranlocal: &mut Tranlocal<T>,
        wanted: LockMode,
    ) -> bool {
        let held = tranlocal.lock_mode();
        if held >= wanted {
            return true;
        }

        match self
            .orec
            .try_upgrade_lock(spin_count, owner, held, wanted, tranlocal.holds_surplus())
        {
            None => false,
            Some(holds_surplus) => {
                tranlocal.mark_locked(wanted, holds_surplus);
                held != LockMode::None || self.orec.version() == tranlocal.version()
            }
        }
    }

    // ========================================================================
    // Commit and abort
    // ========================================================================

    /// Publish a dirty write, otherwise only release the read obligation
    pub(crate) fn commit_dirty(&self, tranlocal: &mut Tranlocal<T>) -> Option<Listeners> {
        if tranlocal.is_dirty_write() {
            self.publish(tranlocal)
        } else {
            self.depart_after_read(tranlocal);
            None
        }
    }

    /// Publish every write regardless of dirtiness
    pub(crate) fn commit_all(&self, tranlocal: &mut Tranlocal<T>) -> Option<Listeners> {
        if tranlocal.is_write() {
            self.publish(tranlocal)
        } else {
            self.depart_after_read(tranlocal);
            None
        }
    }

    fn publish(&self, tranlocal: &mut Tranlocal<T>) -> Option<Listeners> {
        debug_assert_eq!(tranlocal.lock_mode(), LockMode::Commit);
        let version = self.orec.version() + 1;
        let snapshot = Owned::new(Snapshot {
            value: tranlocal.take_value_for_publication(),
            version,
        });

        {
            let guard = epoch::pin();
            let retired = self.active.swap(snapshot, Ordering::SeqCst, &guard);
            if !retired.is_null() {
                // SAFETY: the swap unlinked the retired snapshot; readers that
                // still see it are pinned and keep it alive
                unsafe { guard.defer_destroy(retired) };
            }
        }

        let published = self
            .orec
            .depart_after_update_and_unlock(tranlocal.holds_surplus());
        debug_assert_eq!(published, version);
        tranlocal.mark_released();

        self.listeners.detach()
    }

    fn depart_after_read(&self, tranlocal: &mut Tranlocal<T>) {
        if tranlocal.lock_mode() != LockMode::None {
            self.orec.unlock_after_reading(tranlocal.holds_surplus());
        } else if tranlocal.holds_surplus() {
            self.orec.depart_after_reading();
        }
        tranlocal.mark_released();
    }

    /// Release everything `tranlocal` holds without publishing
    pub(crate) fn abort(&self, tranlocal: &mut Tranlocal<T>) {
        if tranlocal.lock_mode() != LockMode::None {
            self.release_lock(tranlocal.holds_surplus());
        } else if tranlocal.holds_surplus() {
            self.orec.depart_after_failure();
        }
        tranlocal.mark_released();
    }

    fn release_lock(&self, holds_surplus: bool) {
        if holds_surplus {
            self.orec.depart_after_failure_and_unlock();
        } else {
            self.orec.unlock_by_read_biased();
        }
    }

    // ========================================================================
    // Blocking retry
    // ========================================================================

    /// Ask to be woken when the value read at `version` is replaced
    ///
    /// The version is checked again after the listener is installed; if a
    /// commit slipped in, the latch is opened here instead of being left
    /// for a notification that already happened.
    pub(crate) fn register_change_listener(
        &self,
        latch: &Arc<Latch>,
        version: u64,
        era: u64,
    ) -> Registration {
        if self.orec.version() != version {
            latch.open(era);
            return Registration::NotNeeded;
        }

        self.listeners.push(Arc::clone(latch), era);

        if self.orec.version() != version {
            latch.open(era);
            return Registration::NotNeeded;
        }
        Registration::Done
    }
}

impl<T: TxnValue> Drop for RefCore<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no reader is left
        unsafe {
            let guard = epoch::unprotected();
            let active = self.active.load(Ordering::Relaxed, guard);
            if !active.is_null() {
                drop(active.into_owned());
            }
        }
    }
}

impl<T: TxnValue> std::fmt::Debug for RefCore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCore")
            .field("id", &self.id)
            .field("version", &self.orec.version())
            .field("lock", &self.orec.lock_mode())
            .field("surplus", &self.orec.surplus())
            .finish()
    }
}
