//! Transaction state machine
//!
//! A [`Transaction`] attaches a tranlocal for every reference it opens and
//! drives them through prepare, commit and abort. The attachment storage is
//! picked from a [`TransactionKind`]:
//!
//! - Lean variants implement the common path only. Anything else (commute,
//!   blocking on several references, change listeners) fails with a
//!   speculative configuration error so the executor can rerun the closure
//!   with a fat variant.
//! - Mono and array storage are bounded; overflowing them is also a
//!   speculative failure, carrying the number of attachments needed.
//!
//! ## Lifecycle
//!
//! ```text
//! Active ──prepare──► Prepared ──commit──► Committed
//!    │                   │
//!    └──────abort────────┴──────────────► Aborted
//! ```
//!
//! Every error reported by an operation has already aborted the
//! transaction, except errors reported against a transaction that was
//! dead to begin with.
//!
//! ## Read consistency
//!
//! The first load of an attempt snapshots the global conflict counter. Each
//! later load re-reads it; if any update committed since, every tracked read
//! is revalidated so the closure never sees an inconsistent state.

use crate::latch::Latch;
use crate::listeners::Listeners;
use crate::pool::TranlocalPool;
use crate::reference::{Loaded, LoadError, RefCore, Registration, TxnValue};
use crate::stm::Stm;
use crate::storage::{Attachment, AttachmentStorage, StorageKind};
use crate::tranlocal::{CommutingTranlocal, PrepareContext, Tranlocal, TranlocalStatus};
use crate::tref::TRef;
use crate::conflict_counter::LocalConflictCounter;
use std::sync::Arc;
use strata_core::config::TxnConfig;
use strata_core::error::{ConflictKind, FatFeature, Speculation, StmError, StmResult};
use strata_core::types::{LockMode, RefId, TransactionStatus, TxnId};
use tracing::{debug, trace};

/// Storage strategy plus feature level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionKind {
    /// How attachments are indexed
    pub storage: StorageKind,
    /// Whether commute, multi-reference retry and change listeners are available
    pub fat: bool,
}

impl TransactionKind {
    /// One reference, common path only
    pub const fn lean_mono() -> Self {
        Self {
            storage: StorageKind::Mono,
            fat: false,
        }
    }

    /// One reference, every feature
    pub const fn fat_mono() -> Self {
        Self {
            storage: StorageKind::Mono,
            fat: true,
        }
    }

    /// Up to `capacity` references, common path only
    pub const fn lean_array(capacity: usize) -> Self {
        Self {
            storage: StorageKind::Array { capacity },
            fat: false,
        }
    }

    /// Up to `capacity` references, every feature
    pub const fn fat_array(capacity: usize) -> Self {
        Self {
            storage: StorageKind::Array { capacity },
            fat: true,
        }
    }

    /// Unbounded, common path only
    pub const fn lean_map() -> Self {
        Self {
            storage: StorageKind::Map,
            fat: false,
        }
    }

    /// Unbounded, every feature
    pub const fn fat_map() -> Self {
        Self {
            storage: StorageKind::Map,
            fat: true,
        }
    }
}

impl Default for TransactionKind {
    fn default() -> Self {
        Self::fat_map()
    }
}

/// Result of [`Transaction::open_for_read`]
#[derive(Debug)]
pub enum ReadView<'a, T: TxnValue> {
    /// The read is attached and will be validated
    Tracked(&'a Tranlocal<T>),
    /// Read of a read-biased reference that was not attached
    Untracked {
        /// Value read
        value: T,
        /// Version it was read at
        version: u64,
    },
}

impl<'a, T: TxnValue> ReadView<'a, T> {
    /// Value seen by the transaction
    pub fn value(&self) -> &T {
        match self {
            ReadView::Tracked(tranlocal) => tranlocal.value(),
            ReadView::Untracked { value, .. } => value,
        }
    }

    /// Version the value was read at
    pub fn version(&self) -> u64 {
        match self {
            ReadView::Tracked(tranlocal) => tranlocal.version(),
            ReadView::Untracked { version, .. } => *version,
        }
    }

    /// True if the read is attached to the transaction
    pub fn is_tracked(&self) -> bool {
        matches!(self, ReadView::Tracked(_))
    }

    /// Take the value out of the view
    pub fn into_value(self) -> T {
        match self {
            ReadView::Tracked(tranlocal) => tranlocal.value().clone(),
            ReadView::Untracked { value, .. } => value,
        }
    }
}

/// A transaction attempt and everything it has attached
///
/// Transactions are created by [`Stm`] and are reused across the attempts of
/// one executor run. Dropping a live transaction aborts it.
pub struct Transaction {
    id: TxnId,
    stm: Stm,
    config: Arc<TxnConfig>,
    kind: TransactionKind,
    status: TransactionStatus,
    attempt: u32,
    remaining_timeout_ns: Option<i64>,
    abort_only: bool,
    attached: AttachmentStorage,
    pool: TranlocalPool,
    local_conflict_counter: LocalConflictCounter,
    has_untracked_reads: bool,
    latch: Arc<Latch>,
    listener_era: Option<u64>,
}

impl Transaction {
    pub(crate) fn new(stm: Stm, config: Arc<TxnConfig>, kind: TransactionKind) -> Self {
        let id = TxnId::next();
        let local_conflict_counter = LocalConflictCounter::new(stm.conflict_counter());
        debug!(
            target: "strata::stm",
            txn = %id,
            family = %config.family_name,
            ?kind,
            "Transaction started"
        );
        Self {
            id,
            remaining_timeout_ns: config.timeout_ns.map(clamp_timeout),
            stm,
            config,
            kind,
            status: TransactionStatus::Active,
            attempt: 1,
            abort_only: false,
            attached: AttachmentStorage::new(kind.storage),
            pool: TranlocalPool::new(),
            local_conflict_counter,
            has_untracked_reads: false,
            latch: Arc::new(Latch::new()),
            listener_era: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Transaction id, also the owner id recorded in locked orecs
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// STM instance this transaction runs on
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Current lifecycle status
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Storage strategy and feature level
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Configuration
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Number of attached references
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    /// True if `reference` is attached to this attempt
    pub fn is_attached<T: TxnValue>(&self, reference: &TRef<T>) -> bool {
        self.attached.contains(reference.id())
    }

    /// Blocking time left, `None` if the configuration has no timeout
    pub fn remaining_timeout_ns(&self) -> Option<i64> {
        self.remaining_timeout_ns
    }

    /// True once [`set_abort_only`](Self::set_abort_only) was called
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// True if this attempt performed reads it did not attach
    pub fn has_untracked_reads(&self) -> bool {
        self.has_untracked_reads
    }

    /// Tranlocals currently pooled for reuse
    pub fn pooled_count(&self) -> usize {
        self.pool.len()
    }

    // ========================================================================
    // Opening references
    // ========================================================================

    /// Open `reference` for reading, taking at least `lock_mode`
    ///
    /// The configured read lock mode is applied on top of `lock_mode`. A fat
    /// transaction with read tracking disabled skips attaching reads of
    /// read-biased references; such reads come back as
    /// [`ReadView::Untracked`].
    ///
    /// # Errors
    ///
    /// - `ReadWriteConflict` if the reference is locked past the spin budget,
    ///   the lock cannot be acquired, or an earlier read became stale
    /// - `SpeculativeConfiguration` if the attachment storage is full
    /// - `StmMismatch` for a reference of another STM instance
    /// - `DeadTransaction` / `PreparedTransaction` if not active
    pub fn open_for_read<T: TxnValue>(
        &mut self,
        reference: &TRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<ReadView<'_, T>> {
        self.check_active()?;
        self.check_stm(reference.core())?;
        let lock_mode = lock_mode.max(self.config.read_lock_mode);
        let id = reference.id();

        if self.attached.contains(id) {
            self.flatten_commuting(reference.core())?;
            self.lock_attached(reference.core(), lock_mode, ConflictKind::Read)?;
            return self.tranlocal_ref(id).map(ReadView::Tracked);
        }

        let loaded = self.load(reference.core(), lock_mode)?;
        if self.can_skip_tracking(lock_mode, &loaded) {
            self.has_untracked_reads = true;
            self.validate_after_load()?;
            return Ok(ReadView::Untracked {
                value: loaded.value,
                version: loaded.version,
            });
        }

        let tranlocal =
            self.pool
                .tranlocal(Arc::clone(reference.core()), loaded, TranlocalStatus::ReadOnly);
        self.attach(tranlocal)?;
        self.validate_after_load()?;
        self.tranlocal_ref(id).map(ReadView::Tracked)
    }

    /// Open `reference` for writing and return its private copy
    ///
    /// The configured write lock mode is applied on top of `lock_mode`. An
    /// attached read is upgraded in place; an attached commute is flattened
    /// first, which makes the reference a tracked read.
    ///
    /// # Errors
    ///
    /// As [`open_for_read`](Self::open_for_read), plus `Readonly` on a
    /// readonly transaction.
    pub fn open_for_write<T: TxnValue>(
        &mut self,
        reference: &TRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal<T>> {
        self.check_active()?;
        self.check_writable("open_for_write")?;
        self.check_stm(reference.core())?;
        let lock_mode = lock_mode.max(self.config.write_lock_mode);
        let id = reference.id();

        if self.attached.contains(id) {
            self.flatten_commuting(reference.core())?;
            self.lock_attached(reference.core(), lock_mode, ConflictKind::Write)?;
        } else {
            let loaded = self.load(reference.core(), lock_mode)?;
            let tranlocal =
                self.pool
                    .tranlocal(Arc::clone(reference.core()), loaded, TranlocalStatus::Update);
            self.attach(tranlocal)?;
            self.validate_after_load()?;
        }

        let tranlocal = self.tranlocal_mut::<T>(id)?;
        tranlocal.upgrade_to_update();
        Ok(tranlocal)
    }

    /// Open a reference this transaction is constructing
    ///
    /// Opening it again returns the same attachment.
    ///
    /// # Errors
    ///
    /// - `IllegalArgument` if the reference is already committed, is being
    ///   constructed by another transaction, or was opened for read or write
    /// - `Readonly` on a readonly transaction
    pub fn open_for_construction<T: TxnValue>(
        &mut self,
        reference: &TRef<T>,
    ) -> StmResult<&mut Tranlocal<T>> {
        self.check_active()?;
        self.check_writable("open_for_construction")?;
        self.check_stm(reference.core())?;
        let id = reference.id();

        if self.attached.contains(id) {
            let status = self.attached.find(id).map(|a| a.status());
            if status != Some(TranlocalStatus::Construction) {
                return self.fail(StmError::IllegalArgument(format!(
                    "{} is already opened for read or write",
                    id
                )));
            }
            return self.tranlocal_mut(id);
        }

        let value = match reference.core().uncommitted_value(self.id) {
            Some(value) => value,
            None => {
                return self.fail(StmError::IllegalArgument(format!(
                    "{} is not under construction by {}",
                    id, self.id
                )))
            }
        };
        let tranlocal = Tranlocal::constructing(Arc::clone(reference.core()), value);
        self.attach(Box::new(tranlocal))?;
        self.tranlocal_mut(id)
    }

    /// Queue `function` to be applied to `reference` at commit
    ///
    /// If the reference was not read, nothing is loaded now: the function
    /// runs under the commit lock during prepare, so concurrent updates of
    /// the reference do not conflict with this transaction. If it is already
    /// attached, the function is applied to the private copy immediately.
    ///
    /// # Errors
    ///
    /// - `SpeculativeConfiguration` on a lean transaction
    /// - `Readonly` on a readonly transaction
    pub fn commute<T, F>(&mut self, reference: &TRef<T>, function: F) -> StmResult<()>
    where
        T: TxnValue,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.check_active()?;
        self.check_writable("commute")?;
        if !self.kind.fat {
            return self.fail(StmError::SpeculativeConfiguration(
                Speculation::FatRequired(FatFeature::Commute),
            ));
        }
        self.check_stm(reference.core())?;
        let id = reference.id();

        match self.attached.find(id).map(|a| a.status()) {
            Some(TranlocalStatus::Commuting) => {
                match self
                    .attached
                    .find_mut(id)
                    .and_then(|a| a.as_any_mut().downcast_mut::<CommutingTranlocal<T>>())
                {
                    Some(commuting) => {
                        commuting.push(Box::new(function));
                        Ok(())
                    }
                    None => self.fail(attachment_mismatch(id)),
                }
            }
            Some(_) => {
                let tranlocal = self.open_for_write(reference, LockMode::None)?;
                let current = tranlocal.value().clone();
                tranlocal.set_value(function(current));
                Ok(())
            }
            None => {
                let commuting =
                    CommutingTranlocal::new(Arc::clone(reference.core()), Box::new(function));
                self.attach(Box::new(commuting))
            }
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Acquire every lock commit needs and validate
    ///
    /// Writes that must be published are commit locked and checked against
    /// the version they were read at. Under serializable isolation reads are
    /// checked as well; if the transaction also writes they are update locked
    /// so they stay valid until publication. Queued commutes are applied here.
    ///
    /// # Errors
    ///
    /// `ReadWriteConflict` if a lock cannot be acquired or a version moved,
    /// or if the transaction was marked abort only.
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::Prepared => return Ok(()),
            status => return Err(self.dead(status)),
        }
        if self.abort_only {
            return self.fail(StmError::write_conflict(format!(
                "{} is marked abort only",
                self.id
            )));
        }

        let ctx = PrepareContext {
            txn: self.id,
            spin_count: self.config.spin_count,
            dirty_check: self.config.dirty_check,
            serializable: self.config.is_serializable(),
            has_writes: self
                .attached
                .iter()
                .any(|a| a.status() != TranlocalStatus::ReadOnly),
        };

        let mut failure = None;
        for slot in self.attached.iter_mut() {
            match slot.prepare(&ctx) {
                Ok(Some(replacement)) => *slot = replacement,
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            return self.fail(e);
        }

        if ctx.serializable
            && self.has_untracked_reads
            && self
                .local_conflict_counter
                .sync_and_check_conflict(self.stm.conflict_counter())
        {
            return self.fail(StmError::read_conflict(
                "an untracked read may have been overwritten",
            ));
        }

        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// Prepare if needed, then publish every dirty write
    ///
    /// Committing a committed transaction is a no-op.
    ///
    /// # Errors
    ///
    /// - `DeadTransaction` if the transaction was aborted
    /// - anything [`prepare`](Self::prepare) reports
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Aborted => return Err(self.dead(TransactionStatus::Aborted)),
            TransactionStatus::Active => self.prepare()?,
            TransactionStatus::Prepared => {}
        }

        let dirty_check = self.config.dirty_check;
        self.signal_overwritten_readers(dirty_check);
        let mut listeners = Listeners::default();
        for slot in self.attached.iter_mut() {
            if let Some(detached) = slot.commit(dirty_check) {
                listeners.append(detached);
            }
        }
        self.status = TransactionStatus::Committed;
        let attached = self.attached.len();
        self.recycle_attachments();

        let woken = listeners.len();
        listeners.open_all();
        debug!(
            target: "strata::stm",
            txn = %self.id,
            attempt = self.attempt,
            attached,
            woken,
            "Transaction committed"
        );
        Ok(())
    }

    /// Move the global conflict counter before anything becomes visible
    ///
    /// A reader that already holds one of the values about to be replaced
    /// must notice the move on its next load, even if that load returns a
    /// value this commit published first.
    fn signal_overwritten_readers(&mut self, dirty_check: bool) {
        if self
            .attached
            .iter_mut()
            .any(|slot| slot.publishes_over_readers(dirty_check))
        {
            self.stm.conflict_counter().signal_conflict();
        }
    }

    /// Release every lock and arrival without publishing
    ///
    /// Aborting an aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// `DeadTransaction` if the transaction already committed.
    pub fn abort(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Aborted => Ok(()),
            TransactionStatus::Committed => Err(self.dead(TransactionStatus::Committed)),
            _ => {
                self.abort_quietly();
                Ok(())
            }
        }
    }

    pub(crate) fn abort_quietly(&mut self) {
        if self.status.is_dead() {
            return;
        }
        for slot in self.attached.iter_mut() {
            slot.abort();
        }
        self.recycle_attachments();
        self.status = TransactionStatus::Aborted;
        trace!(target: "strata::stm", txn = %self.id, attempt = self.attempt, "Transaction aborted");
    }

    /// Make any later commit fail with a conflict
    ///
    /// # Errors
    ///
    /// `PreparedTransaction` or `DeadTransaction` if not active.
    pub fn set_abort_only(&mut self) -> StmResult<()> {
        self.check_active()?;
        self.abort_only = true;
        Ok(())
    }

    // ========================================================================
    // Blocking
    // ========================================================================

    /// Abort and block until something this transaction read changes
    ///
    /// Always returns an error: [`StmError::Retry`] when the wait was set up,
    /// which the executor consumes by calling
    /// [`await_update`](Self::await_update) and rerunning the closure.
    ///
    /// # Errors
    ///
    /// - `RetryNotAllowed` if blocking is disabled
    /// - `RetryNotPossible` if nothing tracked was read
    /// - `SpeculativeConfiguration` on a lean transaction with more than one
    ///   attached reference
    pub fn retry<R>(&mut self) -> StmResult<R> {
        self.check_active()?;
        if !self.config.blocking_allowed {
            let txn = self.id;
            return self.fail(StmError::RetryNotAllowed { txn });
        }
        if self.attached.is_empty() {
            let txn = self.id;
            return self.fail(StmError::RetryNotPossible { txn });
        }
        if !self.kind.fat && self.attached.len() > 1 {
            return self.fail(StmError::SpeculativeConfiguration(
                Speculation::FatRequired(FatFeature::MultiReferenceRetry),
            ));
        }

        let era = self.latch.reset();
        let latch = Arc::clone(&self.latch);
        let registered = self.register_listeners(&latch, era);
        self.abort_quietly();
        if !registered {
            return Err(StmError::RetryNotPossible { txn: self.id });
        }

        self.listener_era = Some(era);
        debug!(target: "strata::stm", txn = %self.id, attempt = self.attempt, "Transaction waiting for update");
        Err(StmError::Retry)
    }

    /// Wait for the latch armed by the last [`retry`](Self::retry)
    ///
    /// Consumes the remaining timeout when one is configured.
    ///
    /// # Errors
    ///
    /// - `RetryTimeout` if the timeout ran out first
    /// - `IllegalState` if no retry is pending
    pub fn await_update(&mut self) -> StmResult<()> {
        let era = match self.listener_era.take() {
            Some(era) => era,
            None => {
                return Err(StmError::IllegalState(format!(
                    "{} has no pending retry",
                    self.id
                )))
            }
        };

        match self.remaining_timeout_ns {
            None => {
                self.latch.await_open(era);
                Ok(())
            }
            Some(remaining) => {
                let left = self.latch.try_await_nanos(era, remaining);
                self.remaining_timeout_ns = Some(left);
                if left < 0 {
                    debug!(target: "strata::stm", txn = %self.id, "Transaction timed out waiting for update");
                    return Err(StmError::RetryTimeout { txn: self.id });
                }
                Ok(())
            }
        }
    }

    /// Install `latch` on every tracked read, then abort
    ///
    /// The latch is opened by the next commit that changes any of them.
    ///
    /// # Errors
    ///
    /// - `SpeculativeConfiguration` on a lean transaction
    /// - `RetryNotPossible` if nothing tracked was read
    pub fn register_change_listener_and_abort(&mut self, latch: &Arc<Latch>) -> StmResult<()> {
        self.check_active()?;
        if !self.kind.fat {
            return self.fail(StmError::SpeculativeConfiguration(
                Speculation::FatRequired(FatFeature::ChangeListener),
            ));
        }
        let era = latch.era();
        let registered = self.register_listeners(latch, era);
        self.abort_quietly();
        if !registered {
            return Err(StmError::RetryNotPossible { txn: self.id });
        }
        Ok(())
    }

    fn register_listeners(&self, latch: &Arc<Latch>, era: u64) -> bool {
        let mut registered = false;
        for attachment in self.attached.iter() {
            match attachment.register_change_listener(latch, era) {
                Registration::Done => registered = true,
                // Already open; waiting on the others adds nothing
                Registration::NotNeeded => return true,
                Registration::None => {}
            }
        }
        registered
    }

    // ========================================================================
    // Reuse between attempts
    // ========================================================================

    /// Prepare the next attempt
    ///
    /// Returns false, leaving the transaction aborted, once `max_retries`
    /// attempts were made.
    pub fn soft_reset(&mut self) -> bool {
        self.abort_quietly();
        if self.attempt >= self.config.max_retries {
            return false;
        }
        self.attempt += 1;
        self.reset_attempt_state();
        true
    }

    /// Start over as a fresh transaction with the same configuration
    pub fn hard_reset(&mut self) {
        self.abort_quietly();
        self.attempt = 1;
        self.remaining_timeout_ns = self.config.timeout_ns.map(clamp_timeout);
        self.reset_attempt_state();
    }

    /// Switch storage strategy and feature level
    ///
    /// Aborts the current attempt; call [`soft_reset`](Self::soft_reset)
    /// before reusing the transaction.
    pub fn reconfigure(&mut self, kind: TransactionKind) {
        self.abort_quietly();
        if kind.storage != self.attached.kind() {
            self.attached = AttachmentStorage::new(kind.storage);
        }
        self.kind = kind;
    }

    fn reset_attempt_state(&mut self) {
        self.status = TransactionStatus::Active;
        self.abort_only = false;
        self.has_untracked_reads = false;
        self.listener_era = None;
        self.local_conflict_counter
            .reset(self.stm.conflict_counter());
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_active(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Prepared => {
                let txn = self.id;
                self.fail(StmError::PreparedTransaction { txn })
            }
            status => Err(self.dead(status)),
        }
    }

    fn check_writable(&mut self, operation: &'static str) -> StmResult<()> {
        if self.config.readonly {
            let txn = self.id;
            return self.fail(StmError::Readonly { txn, operation });
        }
        Ok(())
    }

    fn check_stm<T: TxnValue>(&mut self, core: &RefCore<T>) -> StmResult<()> {
        let found = core.stm_id();
        let expected = self.stm.id();
        if found != expected {
            return self.fail(StmError::StmMismatch { expected, found });
        }
        Ok(())
    }

    fn dead(&self, status: TransactionStatus) -> StmError {
        StmError::DeadTransaction {
            txn: self.id,
            status,
        }
    }

    fn fail<R>(&mut self, error: StmError) -> StmResult<R> {
        self.abort_quietly();
        Err(error)
    }

    fn load<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        lock_mode: LockMode,
    ) -> StmResult<Loaded<T>> {
        if self.attached.is_empty() && !self.has_untracked_reads {
            self.local_conflict_counter
                .reset(self.stm.conflict_counter());
        }

        let spin_count = self.config.spin_count;
        let result = if lock_mode == LockMode::None {
            core.load(spin_count)
        } else {
            core.lock_and_load(spin_count, self.id, lock_mode)
        };

        match result {
            Ok(loaded) => Ok(loaded),
            Err(LoadError::Locked) => {
                self.fail(StmError::read_conflict(format!("{} is locked", core.id())))
            }
            Err(LoadError::Uncommitted) => self.fail(StmError::IllegalState(format!(
                "{} was never committed",
                core.id()
            ))),
        }
    }

    fn can_skip_tracking<T>(&self, lock_mode: LockMode, loaded: &Loaded<T>) -> bool {
        self.kind.fat
            && !self.config.track_reads
            && lock_mode == LockMode::None
            && !loaded.holds_surplus
    }

    /// Revalidate tracked reads if anything committed since the last load
    fn validate_after_load(&mut self) -> StmResult<()> {
        if !self
            .local_conflict_counter
            .sync_and_check_conflict(self.stm.conflict_counter())
        {
            return Ok(());
        }
        if self.has_untracked_reads {
            return self.fail(StmError::read_conflict(
                "an untracked read may have been overwritten",
            ));
        }
        if self.attached.iter().any(|a| a.has_read_conflict()) {
            return self.fail(StmError::read_conflict(
                "a reference read earlier was overwritten",
            ));
        }
        Ok(())
    }

    fn attach(&mut self, attachment: Attachment) -> StmResult<()> {
        match self.attached.insert(attachment) {
            Ok(()) => Ok(()),
            Err(mut rejected) => {
                rejected.abort();
                rejected.recycle(&mut self.pool);
                let required = self.attached.len() + 1;
                self.fail(StmError::SpeculativeConfiguration(Speculation::TooSmall {
                    required,
                }))
            }
        }
    }

    /// Turn an attached commute into a tracked update of the current value
    fn flatten_commuting<T: TxnValue>(&mut self, core: &Arc<RefCore<T>>) -> StmResult<()> {
        let id = core.id();
        let commuting = self.attached.find(id).map(|a| a.status()) == Some(TranlocalStatus::Commuting);
        if !commuting {
            return Ok(());
        }

        let loaded = self.load(core, self.config.read_lock_mode)?;
        let flattened = match self
            .attached
            .find_mut(id)
            .and_then(|a| a.as_any_mut().downcast_mut::<CommutingTranlocal<T>>())
        {
            Some(commuting) => commuting.flatten(loaded),
            None => {
                core.release_loaded(&loaded);
                return self.fail(attachment_mismatch(id));
            }
        };
        if let Some(slot) = self.attached.find_mut(id) {
            *slot = Box::new(flattened);
        }
        self.validate_after_load()
    }

    /// Raise the lock held by an attached tranlocal to at least `lock_mode`
    fn lock_attached<T: TxnValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        lock_mode: LockMode,
        kind: ConflictKind,
    ) -> StmResult<()> {
        if lock_mode == LockMode::None {
            return Ok(());
        }
        let (txn, spin_count) = (self.id, self.config.spin_count);
        let locked = match self
            .attached
            .find_mut(core.id())
            .and_then(|a| a.as_any_mut().downcast_mut::<Tranlocal<T>>())
        {
            Some(tranlocal) => core.try_lock_and_check_conflict(txn, spin_count, tranlocal, lock_mode),
            None => false,
        };
        if locked {
            return Ok(());
        }
        let reason = format!("cannot acquire {} lock on {}", lock_mode, core.id());
        self.fail(match kind {
            ConflictKind::Read => StmError::read_conflict(reason),
            ConflictKind::Write => StmError::write_conflict(reason),
        })
    }

    fn tranlocal_ref<T: TxnValue>(&self, id: RefId) -> StmResult<&Tranlocal<T>> {
        self.attached
            .find(id)
            .and_then(|a| a.as_any().downcast_ref::<Tranlocal<T>>())
            .ok_or_else(|| attachment_mismatch(id))
    }

    fn tranlocal_mut<T: TxnValue>(&mut self, id: RefId) -> StmResult<&mut Tranlocal<T>> {
        self.attached
            .find_mut(id)
            .and_then(|a| a.as_any_mut().downcast_mut::<Tranlocal<T>>())
            .ok_or_else(|| attachment_mismatch(id))
    }

    fn recycle_attachments(&mut self) {
        let pool = &mut self.pool;
        self.attached.clear_with(|attachment| attachment.recycle(pool));
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_quietly();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("family", &self.config.family_name)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("attached", &self.attached.len())
            .finish()
    }
}

fn attachment_mismatch(id: RefId) -> StmError {
    StmError::IllegalState(format!("attachment of {} has an unexpected type", id))
}

fn clamp_timeout(timeout_ns: u64) -> i64 {
    i64::try_from(timeout_ns).unwrap_or(i64::MAX)
}
