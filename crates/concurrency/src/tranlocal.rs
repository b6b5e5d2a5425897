//! Transaction-local snapshots
//!
//! A tranlocal is what a transaction attaches for every reference it opens:
//! the value it read (and, for writes, the private copy it mutates), the
//! version it read at, the lock it holds and whether it holds a surplus unit
//! on the orec.
//!
//! Attachments of different value types live in one table, so the table
//! stores them as `Box<dyn AttachedTranlocal>`. Two implementations exist:
//! - [`Tranlocal<T>`]: a concrete read, write or construction
//! - [`CommutingTranlocal<T>`]: queued commute functions, nothing read yet

use crate::latch::Latch;
use crate::listeners::Listeners;
use crate::pool::TranlocalPool;
use crate::reference::{Loaded, RefCore, Registration, TxnValue};
use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::sync::Arc;
use strata_core::error::{StmError, StmResult};
use strata_core::types::{LockMode, RefId, TxnId, VERSION_UNCOMMITTED};

/// What a transaction does with an attached reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranlocalStatus {
    /// Read only
    ReadOnly,
    /// Private copy that will be published if dirty
    Update,
    /// Reference created by this transaction, not yet committed
    Construction,
    /// Commute functions queued, nothing loaded
    Commuting,
}

/// Whether a write differs from the value it was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyState {
    /// Value equals the value read
    False,
    /// Value differs, or there was nothing to compare against
    True,
    /// Not computed yet
    Unknown,
}

/// Everything `prepare` needs from the transaction
#[derive(Debug, Clone, Copy)]
pub struct PrepareContext {
    /// Transaction taking the locks
    pub txn: TxnId,
    /// Spin budget per lock attempt
    pub spin_count: u32,
    /// Publish only writes whose value changed
    pub dirty_check: bool,
    /// Validate reads as well
    pub serializable: bool,
    /// The transaction publishes something; serializable reads are then
    /// update locked instead of only checked
    pub has_writes: bool,
}

/// A deferred update queued by `commute`
pub type CommuteFn<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Type-erased view of an attachment, used by the transaction lifecycle
pub trait AttachedTranlocal: Send {
    /// Reference this attachment belongs to
    fn ref_id(&self) -> RefId;

    /// Current status
    fn status(&self) -> TranlocalStatus;

    /// Lock held on the reference
    fn lock_mode(&self) -> LockMode;

    /// True if the snapshot read is no longer the committed one
    fn has_read_conflict(&self) -> bool;

    /// Lock and validate for commit
    ///
    /// Returns a replacement attachment when preparation turned this one into
    /// something else (a flattened commute).
    #[doc(hidden)]
    fn prepare(&mut self, ctx: &PrepareContext) -> StmResult<Option<Box<dyn AttachedTranlocal>>>;

    /// True if commit will publish a value some other transaction may hold
    ///
    /// Only meaningful after a successful prepare.
    fn publishes_over_readers(&mut self, dirty_check: bool) -> bool;

    /// Publish (or release) after a successful prepare
    #[doc(hidden)]
    fn commit(&mut self, dirty_check: bool) -> Option<Listeners>;

    /// Release every lock and arrival without publishing
    fn abort(&mut self);

    /// Install `latch` to be opened when the read value changes
    fn register_change_listener(&self, latch: &Arc<Latch>, era: u64) -> Registration;

    /// Hand the allocation back for reuse
    #[doc(hidden)]
    fn recycle(self: Box<Self>, pool: &mut TranlocalPool);

    /// Downcasting support
    fn as_any(&self) -> &dyn Any;

    /// Downcasting support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ============================================================================
// Concrete tranlocal
// ============================================================================

/// A reference opened for read, write or construction
pub struct Tranlocal<T: TxnValue> {
    owner: Arc<RefCore<T>>,
    value: T,
    old_value: Option<T>,
    version: u64,
    lock_mode: LockMode,
    status: TranlocalStatus,
    dirty: DirtyState,
    holds_surplus: bool,
}

impl<T: TxnValue> Tranlocal<T> {
    pub(crate) fn from_loaded(
        owner: Arc<RefCore<T>>,
        loaded: Loaded<T>,
        status: TranlocalStatus,
    ) -> Self {
        let mut tranlocal = Self {
            owner,
            value: loaded.value,
            old_value: None,
            version: loaded.version,
            lock_mode: loaded.lock_mode,
            status: TranlocalStatus::ReadOnly,
            dirty: DirtyState::False,
            holds_surplus: loaded.holds_surplus,
        };
        if status == TranlocalStatus::Update {
            tranlocal.upgrade_to_update();
        }
        tranlocal
    }

    /// Attachment of a reference under construction by this transaction
    pub(crate) fn constructing(owner: Arc<RefCore<T>>, value: T) -> Self {
        Self {
            owner,
            value,
            old_value: None,
            version: VERSION_UNCOMMITTED,
            lock_mode: LockMode::Commit,
            status: TranlocalStatus::Construction,
            dirty: DirtyState::True,
            holds_surplus: true,
        }
    }

    /// Overwrite a recycled tranlocal in place
    pub(crate) fn reinit(&mut self, owner: Arc<RefCore<T>>, loaded: Loaded<T>, status: TranlocalStatus) {
        self.owner = owner;
        self.value = loaded.value;
        self.old_value = None;
        self.version = loaded.version;
        self.lock_mode = loaded.lock_mode;
        self.status = TranlocalStatus::ReadOnly;
        self.dirty = DirtyState::False;
        self.holds_surplus = loaded.holds_surplus;
        if status == TranlocalStatus::Update {
            self.upgrade_to_update();
        }
    }

    /// The reference this tranlocal belongs to
    pub fn owner(&self) -> &Arc<RefCore<T>> {
        &self.owner
    }

    /// Current (possibly private) value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Value read before this transaction started writing, if it writes
    pub fn old_value(&self) -> Option<&T> {
        self.old_value.as_ref()
    }

    /// Version the value was read at (`0` for constructions)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Lock held on the reference
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Current status
    pub fn status(&self) -> TranlocalStatus {
        self.status
    }

    /// Dirty state as last computed
    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    /// True if a surplus unit must be released on the orec
    pub fn holds_surplus(&self) -> bool {
        self.holds_surplus
    }

    /// True for updates and constructions
    pub fn is_write(&self) -> bool {
        matches!(
            self.status,
            TranlocalStatus::Update | TranlocalStatus::Construction
        )
    }

    /// Mutable access to the private copy
    ///
    /// Only meaningful on writes; the transaction hands out `&mut Tranlocal`
    /// exclusively through `open_for_write`.
    pub fn value_mut(&mut self) -> &mut T {
        self.dirty = DirtyState::Unknown;
        if self.status == TranlocalStatus::Construction {
            self.dirty = DirtyState::True;
        }
        &mut self.value
    }

    /// Replace the private copy
    pub fn set_value(&mut self, value: T) {
        *self.value_mut() = value;
    }

    pub(crate) fn upgrade_to_update(&mut self) {
        if self.status == TranlocalStatus::ReadOnly {
            self.old_value = Some(self.value.clone());
            self.status = TranlocalStatus::Update;
            self.dirty = DirtyState::Unknown;
        }
    }

    /// Compute (and cache) whether this write must be published
    pub(crate) fn is_dirty_write(&mut self) -> bool {
        match self.status {
            TranlocalStatus::Construction => true,
            TranlocalStatus::Update => {
                if self.dirty == DirtyState::Unknown {
                    let changed = match &self.old_value {
                        Some(old) => *old != self.value,
                        None => true,
                    };
                    self.dirty = if changed {
                        DirtyState::True
                    } else {
                        DirtyState::False
                    };
                }
                self.dirty == DirtyState::True
            }
            _ => false,
        }
    }

    pub(crate) fn mark_locked(&mut self, lock_mode: LockMode, holds_surplus: bool) {
        self.lock_mode = lock_mode;
        self.holds_surplus = holds_surplus;
    }

    pub(crate) fn mark_released(&mut self) {
        self.lock_mode = LockMode::None;
        self.holds_surplus = false;
    }

    /// Move the value out for publication
    ///
    /// The tranlocal is dead afterwards; its value slot is refilled with the
    /// old value so no clone is needed for ordinary updates.
    pub(crate) fn take_value_for_publication(&mut self) -> T {
        match self.old_value.take() {
            Some(old) => std::mem::replace(&mut self.value, old),
            None => self.value.clone(),
        }
    }

    fn needs_commit_lock(&mut self, dirty_check: bool) -> bool {
        match self.status {
            TranlocalStatus::Construction => false,
            TranlocalStatus::Update => !dirty_check || self.is_dirty_write(),
            _ => false,
        }
    }
}

impl<T: TxnValue> AttachedTranlocal for Tranlocal<T> {
    fn ref_id(&self) -> RefId {
        self.owner.id()
    }

    fn status(&self) -> TranlocalStatus {
        self.status
    }

    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    fn has_read_conflict(&self) -> bool {
        match self.status {
            TranlocalStatus::Construction | TranlocalStatus::Commuting => false,
            _ => self.owner.has_read_conflict(self),
        }
    }

    fn prepare(&mut self, ctx: &PrepareContext) -> StmResult<Option<Box<dyn AttachedTranlocal>>> {
        let owner = Arc::clone(&self.owner);
        if self.needs_commit_lock(ctx.dirty_check) {
            if !owner.try_lock_and_check_conflict(ctx.txn, ctx.spin_count, self, LockMode::Commit) {
                return Err(StmError::write_conflict(format!(
                    "{} was written by another transaction",
                    owner.id()
                )));
            }
        } else if ctx.serializable && self.status != TranlocalStatus::Construction {
            let valid = if ctx.has_writes {
                owner.try_lock_and_check_conflict(ctx.txn, ctx.spin_count, self, LockMode::Update)
            } else {
                !owner.has_read_conflict(self)
            };
            if !valid {
                return Err(StmError::read_conflict(if owner.orec().version() != self.version {
                    format!("{} changed after it was read", owner.id())
                } else {
                    format!("{} is locked by another transaction", owner.id())
                }));
            }
        }
        Ok(None)
    }

    fn publishes_over_readers(&mut self, dirty_check: bool) -> bool {
        let publishes = if dirty_check {
            self.is_dirty_write()
        } else {
            self.is_write()
        };
        publishes && self.owner.orec().has_other_readers(self.holds_surplus)
    }

    fn commit(&mut self, dirty_check: bool) -> Option<Listeners> {
        let owner = Arc::clone(&self.owner);
        if dirty_check {
            owner.commit_dirty(self)
        } else {
            owner.commit_all(self)
        }
    }

    fn abort(&mut self) {
        let owner = Arc::clone(&self.owner);
        owner.abort(self);
    }

    fn register_change_listener(&self, latch: &Arc<Latch>, era: u64) -> Registration {
        match self.status {
            TranlocalStatus::Construction | TranlocalStatus::Commuting => Registration::None,
            _ => self
                .owner
                .register_change_listener(latch, self.version, era),
        }
    }

    fn recycle(self: Box<Self>, pool: &mut TranlocalPool) {
        pool.put(TypeId::of::<Tranlocal<T>>(), self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: TxnValue + std::fmt::Debug> std::fmt::Debug for Tranlocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tranlocal")
            .field("ref", &self.owner.id())
            .field("value", &self.value)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("lock_mode", &self.lock_mode)
            .field("dirty", &self.dirty)
            .finish()
    }
}

// ============================================================================
// Commuting tranlocal
// ============================================================================

/// Commute functions queued on a reference that was never read
///
/// Nothing is loaded until the functions must be applied: at prepare (under
/// the commit lock, so concurrent writers never cause a conflict) or when the
/// transaction opens the reference for real (which makes it a tracked read).
pub struct CommutingTranlocal<T: TxnValue> {
    owner: Arc<RefCore<T>>,
    functions: SmallVec<[CommuteFn<T>; 2]>,
}

impl<T: TxnValue> CommutingTranlocal<T> {
    pub(crate) fn new(owner: Arc<RefCore<T>>, function: CommuteFn<T>) -> Self {
        let mut functions = SmallVec::new();
        functions.push(function);
        Self { owner, functions }
    }

    /// Queue another function (applied after the ones already queued)
    pub(crate) fn push(&mut self, function: CommuteFn<T>) {
        self.functions.push(function);
    }

    /// Number of queued functions
    pub fn pending(&self) -> usize {
        self.functions.len()
    }

    /// Apply the queued functions in FIFO order to `loaded`
    ///
    /// The result is an update whose old value is the loaded value, so its
    /// dirtiness is `result != loaded`.
    pub(crate) fn flatten(&mut self, loaded: Loaded<T>) -> Tranlocal<T> {
        let mut tranlocal =
            Tranlocal::from_loaded(Arc::clone(&self.owner), loaded, TranlocalStatus::Update);
        let mut value = tranlocal.value.clone();
        for function in self.functions.drain(..) {
            value = function(value);
        }
        tranlocal.set_value(value);
        tranlocal
    }
}

impl<T: TxnValue> AttachedTranlocal for CommutingTranlocal<T> {
    fn ref_id(&self) -> RefId {
        self.owner.id()
    }

    fn status(&self) -> TranlocalStatus {
        TranlocalStatus::Commuting
    }

    fn lock_mode(&self) -> LockMode {
        LockMode::None
    }

    fn has_read_conflict(&self) -> bool {
        false
    }

    fn prepare(&mut self, ctx: &PrepareContext) -> StmResult<Option<Box<dyn AttachedTranlocal>>> {
        let loaded = self
            .owner
            .lock_and_load(ctx.spin_count, ctx.txn, LockMode::Commit)
            .map_err(|e| {
                StmError::write_conflict(format!(
                    "cannot apply commuting functions to {}: {}",
                    self.owner.id(),
                    e
                ))
            })?;
        let mut tranlocal = self.flatten(loaded);
        // Computed now so commit can publish or release without a second look
        tranlocal.is_dirty_write();
        Ok(Some(Box::new(tranlocal)))
    }

    fn publishes_over_readers(&mut self, _dirty_check: bool) -> bool {
        false
    }

    fn commit(&mut self, _dirty_check: bool) -> Option<Listeners> {
        None
    }

    fn abort(&mut self) {
        self.functions.clear();
    }

    fn register_change_listener(&self, _latch: &Arc<Latch>, _era: u64) -> Registration {
        Registration::None
    }

    fn recycle(self: Box<Self>, _pool: &mut TranlocalPool) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
