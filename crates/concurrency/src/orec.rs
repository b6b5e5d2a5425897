//! Ownership record (orec)
//!
//! Every transactional reference owns one orec. It replaces a full
//! reader-writer lock with three atomics:
//!
//! - `state`: lock bits, read-bias flag, read-only commit count and the
//!   surplus (number of transactions holding a stake in the current value)
//! - `version`: bumped exactly once per update commit
//! - `owner`: id of the transaction holding the lock, `0` when free
//!
//! # State word layout
//!
//! ```text
//!  63                    13 12           3   2     1 0
//! +------------------------+--------------+----+-------+
//! |        surplus         | readonly cnt |bias| lock  |
//! +------------------------+--------------+----+-------+
//! ```
//!
//! Nothing in here blocks. Lock and arrival attempts spin a bounded number
//! of times and then report failure; blocking belongs to the latch layer.
//!
//! # Surplus accounting
//!
//! A transaction that arrives normally holds one surplus unit until it
//! departs. On a read biased orec readers do not arrive at all, and a lock
//! taken on a read biased orec carries no unit either. Callers remember
//! whether they hold a unit and pass it back on release.

use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::types::{LockMode, TxnId, INITIAL_VERSION, VERSION_UNCOMMITTED};

const LOCK_MASK: u64 = 0b11;
const LOCK_UPDATE: u64 = 0b01;
const LOCK_COMMIT: u64 = 0b10;
const READ_BIASED_BIT: u64 = 1 << 2;
const READONLY_SHIFT: u32 = 3;
const READONLY_MASK: u64 = 0x3FF << READONLY_SHIFT;
const SURPLUS_SHIFT: u32 = 13;
const SURPLUS_ONE: u64 = 1 << SURPLUS_SHIFT;

/// Consecutive read-only departures after which an orec becomes read biased
pub const READ_BIASED_THRESHOLD: u64 = 16;

/// Outcome of an arrival attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Surplus was incremented; the caller must depart later
    Normal,
    /// The orec is read biased; nothing was registered
    ReadBiased,
    /// The orec stayed locked for the whole spin budget
    LockNotFree,
}

impl Arrival {
    /// True if the arrival registered a surplus unit
    pub fn holds_surplus(&self) -> bool {
        matches!(self, Arrival::Normal)
    }
}

#[inline]
fn lock_bits(mode: LockMode) -> u64 {
    match mode {
        LockMode::None => 0,
        LockMode::Update => LOCK_UPDATE,
        LockMode::Commit => LOCK_COMMIT,
    }
}

#[inline]
fn lock_mode_of(state: u64) -> LockMode {
    match state & LOCK_MASK {
        LOCK_UPDATE => LockMode::Update,
        LOCK_COMMIT => LockMode::Commit,
        _ => LockMode::None,
    }
}

#[inline]
fn surplus_of(state: u64) -> u64 {
    state >> SURPLUS_SHIFT
}

#[inline]
fn readonly_count_of(state: u64) -> u64 {
    (state & READONLY_MASK) >> READONLY_SHIFT
}

#[inline]
fn is_biased(state: u64) -> bool {
    state & READ_BIASED_BIT != 0
}

/// Per-reference concurrency control metadata
#[derive(Debug)]
pub struct Orec {
    state: AtomicU64,
    version: AtomicU64,
    owner: AtomicU64,
}

impl Orec {
    /// Orec of a reference created already committed
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            version: AtomicU64::new(INITIAL_VERSION),
            owner: AtomicU64::new(0),
        }
    }

    /// Orec of a reference under construction
    ///
    /// The constructing transaction holds the commit lock and one surplus
    /// unit, so nobody else can read the reference before it is committed.
    pub fn new_constructing(owner: TxnId) -> Self {
        Self {
            state: AtomicU64::new(LOCK_COMMIT | SURPLUS_ONE),
            version: AtomicU64::new(VERSION_UNCOMMITTED),
            owner: AtomicU64::new(owner.as_u64()),
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Current committed version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of transactions holding a stake in the current value
    pub fn surplus(&self) -> u64 {
        surplus_of(self.state.load(Ordering::Acquire))
    }

    /// Lock currently held on this orec
    pub fn lock_mode(&self) -> LockMode {
        lock_mode_of(self.state.load(Ordering::Acquire))
    }

    /// True if any lock is held
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & LOCK_MASK != 0
    }

    /// True if the commit lock is held
    pub fn is_commit_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & LOCK_MASK == LOCK_COMMIT
    }

    /// True once reads stopped registering surplus
    pub fn is_read_biased(&self) -> bool {
        is_biased(self.state.load(Ordering::Acquire))
    }

    /// Read-only departures since the last update
    pub fn readonly_count(&self) -> u64 {
        readonly_count_of(self.state.load(Ordering::Acquire))
    }

    /// Transaction holding the lock, if any
    pub fn owner(&self) -> Option<TxnId> {
        TxnId::from_raw(self.owner.load(Ordering::Acquire))
    }

    // ========================================================================
    // Arrival
    // ========================================================================

    /// Register as a reader of the current value
    ///
    /// An update lock does not keep readers out; only a commit lock does.
    /// Readers of an update locked orec always arrive for real, even when it
    /// is read biased.
    pub fn arrive(&self, spin_count: u32) -> Arrival {
        let mut spins = spin_count;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & LOCK_MASK == LOCK_COMMIT {
                if spins == 0 {
                    return Arrival::LockNotFree;
                }
                spins -= 1;
                std::hint::spin_loop();
                continue;
            }

            if is_biased(state) && state & LOCK_MASK == 0 {
                return Arrival::ReadBiased;
            }

            if self
                .state
                .compare_exchange_weak(
                    state,
                    state + SURPLUS_ONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Arrival::Normal;
            }
        }
    }

    /// Acquire an update or commit lock and arrive in one step
    ///
    /// Fails when any lock is held by someone else after `spin_count` spins.
    pub fn try_lock_and_arrive(&self, spin_count: u32, commit_lock: bool, owner: TxnId) -> Arrival {
        let wanted = if commit_lock { LOCK_COMMIT } else { LOCK_UPDATE };
        let mut spins = spin_count;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & LOCK_MASK != 0 {
                if spins == 0 {
                    return Arrival::LockNotFree;
                }
                spins -= 1;
                std::hint::spin_loop();
                continue;
            }

            let biased = is_biased(state);
            let mut next = state | wanted;
            if !biased {
                next += SURPLUS_ONE;
            }

            if self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.owner.store(owner.as_u64(), Ordering::Release);
                return if biased {
                    Arrival::ReadBiased
                } else {
                    Arrival::Normal
                };
            }
        }
    }

    /// Acquire or strengthen a lock for a transaction that already read the value
    ///
    /// `held` is the lock the caller owns now, `holds_surplus` whether it holds
    /// a surplus unit. Returns `None` if the lock could not be acquired within
    /// the spin budget, otherwise whether the caller holds a surplus unit
    /// afterwards.
    pub fn try_upgrade_lock(
        &self,
        spin_count: u32,
        owner: TxnId,
        held: LockMode,
        wanted: LockMode,
        holds_surplus: bool,
    ) -> Option<bool> {
        if wanted <= held {
            return Some(holds_surplus);
        }

        let mut spins = spin_count;
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (next, holds) = if held == LockMode::None {
                if state & LOCK_MASK != 0 {
                    if spins == 0 {
                        return None;
                    }
                    spins -= 1;
                    std::hint::spin_loop();
                    continue;
                }
                let add = !holds_surplus && !is_biased(state);
                let mut next = state | lock_bits(wanted);
                if add {
                    next += SURPLUS_ONE;
                }
                (next, holds_surplus || add)
            } else {
                ((state & !LOCK_MASK) | lock_bits(wanted), holds_surplus)
            };

            if self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.owner.store(owner.as_u64(), Ordering::Release);
                return Some(holds);
            }
        }
    }

    // ========================================================================
    // Departure
    // ========================================================================

    /// Depart after a read-only commit
    ///
    /// Counts the read-only departure; crossing [`READ_BIASED_THRESHOLD`]
    /// flips the orec to read biased. The flag never changes while a lock is
    /// held.
    pub fn depart_after_reading(&self) {
        self.update_state(|state| {
            let next = state - SURPLUS_ONE;
            Some(count_readonly(next))
        });
    }

    /// Depart without counting a read-only commit (abort, failed load)
    pub fn depart_after_failure(&self) {
        self.update_state(|state| Some(state - SURPLUS_ONE));
    }

    /// True if a transaction other than the lock holder may hold the current value
    ///
    /// `holds_surplus` tells whether the caller owns one of the arrived units.
    /// A read biased orec is assumed to have readers since they never arrive.
    pub fn has_other_readers(&self, holds_surplus: bool) -> bool {
        let state = self.state.load(Ordering::Acquire);
        is_biased(state) || surplus_of(state) > u64::from(holds_surplus)
    }

    /// Publish a new version and release the lock
    ///
    /// The caller must hold the commit lock, must already have installed the
    /// new value, and must have signalled the global conflict counter before
    /// the first value of its commit became visible if
    /// [`has_other_readers`](Self::has_other_readers) held. Bumps the version,
    /// then unlocks. Resets the read bias. Returns the new version.
    pub fn depart_after_update_and_unlock(&self, holds_surplus: bool) -> u64 {
        let own = u64::from(holds_surplus);
        let new_version = self.version.load(Ordering::Acquire) + 1;
        self.version.store(new_version, Ordering::SeqCst);

        self.owner.store(0, Ordering::Release);
        self.update_state(|state| {
            let surplus = surplus_of(state).saturating_sub(own);
            Some(surplus << SURPLUS_SHIFT)
        });
        new_version
    }

    /// Release the lock and the surplus unit without publishing
    pub fn depart_after_failure_and_unlock(&self) {
        self.owner.store(0, Ordering::Release);
        self.update_state(|state| Some((state & !LOCK_MASK) - SURPLUS_ONE));
    }

    /// Release a lock that was taken on a read biased orec (no surplus held)
    pub fn unlock_by_read_biased(&self) {
        self.owner.store(0, Ordering::Release);
        self.update_state(|state| Some(state & !LOCK_MASK));
    }

    /// Release a lock held on a value that was only read
    pub fn unlock_after_reading(&self, holds_surplus: bool) {
        self.owner.store(0, Ordering::Release);
        self.update_state(|state| {
            let unlocked = state & !LOCK_MASK;
            if holds_surplus {
                Some(count_readonly(unlocked - SURPLUS_ONE))
            } else {
                Some(unlocked)
            }
        });
    }

    fn update_state<F>(&self, mut f: F)
    where
        F: FnMut(u64) -> Option<u64>,
    {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                debug_assert!(
                    surplus_of(state) > 0 || state & LOCK_MASK != 0,
                    "orec departure without arrival"
                );
                f(state)
            });
        debug_assert!(result.is_ok());
    }
}

impl Default for Orec {
    fn default() -> Self {
        Self::new()
    }
}

/// Count one read-only departure on an unlocked, unbiased state
#[inline]
fn count_readonly(state: u64) -> u64 {
    if state & LOCK_MASK != 0 || is_biased(state) {
        return state;
    }
    let count = readonly_count_of(state) + 1;
    if count >= READ_BIASED_THRESHOLD {
        (state & !READONLY_MASK) | READ_BIASED_BIT
    } else {
        (state & !READONLY_MASK) | (count << READONLY_SHIFT)
    }
}
