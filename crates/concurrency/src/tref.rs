//! Transactional references
//!
//! [`TRef`] is the user-facing handle of a [`RefCore`]. Its transactional
//! operations take the transaction explicitly; the `atomic_*` operations run
//! a one-reference transaction of their own.
//!
//! # Example
//!
//! ```
//! use strata_concurrency::{Stm, TRef};
//!
//! let stm = Stm::new();
//! let balance: TRef<i64> = stm.new_ref(10);
//! stm.atomically(|tx| {
//!     let current = balance.get(tx)?;
//!     balance.set(tx, current + 5)
//! })
//! .unwrap();
//! assert_eq!(balance.atomic_get().unwrap(), 15);
//! ```

use crate::reference::{LoadError, RefCore, TxnValue};
use crate::stm::Stm;
use crate::transaction::Transaction;
use std::ops::{Add, Sub};
use std::sync::Arc;
use strata_core::error::{StmError, StmResult};
use strata_core::types::{LockMode, RefId, StmId};

/// A transactional reference
pub struct TRef<T: TxnValue> {
    core: Arc<RefCore<T>>,
}

/// Reference to an `i32`
pub type IntRef = TRef<i32>;
/// Reference to an `i64`
pub type LongRef = TRef<i64>;
/// Reference to an `f64`
pub type DoubleRef = TRef<f64>;
/// Reference to a `bool`
pub type BooleanRef = TRef<bool>;
/// Reference to any value
pub type Ref<T> = TRef<T>;

impl<T: TxnValue> Clone for TRef<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: TxnValue> TRef<T> {
    /// Create a committed reference on `stm`
    pub fn new(stm: &Stm, value: T) -> Self {
        Self {
            core: Arc::new(RefCore::new(stm.clone(), value)),
        }
    }

    /// Create a reference inside `tx`
    ///
    /// The reference becomes visible to other transactions when `tx`
    /// commits. Until then it is commit locked by `tx`; if `tx` aborts, it
    /// can never be read.
    ///
    /// # Errors
    ///
    /// `Readonly`, `DeadTransaction` or `PreparedTransaction` as for any open.
    pub fn new_uncommitted(tx: &mut Transaction, value: T) -> StmResult<Self> {
        let reference = Self {
            core: Arc::new(RefCore::new_constructing(tx.stm().clone(), tx.id(), value)),
        };
        tx.open_for_construction(&reference)?;
        Ok(reference)
    }

    /// Identity of the reference
    pub fn id(&self) -> RefId {
        self.core.id()
    }

    /// STM instance the reference belongs to
    pub fn stm_id(&self) -> StmId {
        self.core.stm_id()
    }

    /// Committed version (`0` while under construction)
    pub fn version(&self) -> u64 {
        self.core.orec().version()
    }

    /// Surplus of readers currently arrived
    pub fn surplus(&self) -> u64 {
        self.core.orec().surplus()
    }

    /// Lock currently held on the reference
    pub fn lock_mode(&self) -> LockMode {
        self.core.orec().lock_mode()
    }

    /// True once the reference switched to read-biased mode
    pub fn is_read_biased(&self) -> bool {
        self.core.orec().is_read_biased()
    }

    /// True if a blocked transaction waits on this reference
    pub fn has_listeners(&self) -> bool {
        self.core.has_listeners()
    }

    /// Shared state behind the handle
    pub fn core(&self) -> &Arc<RefCore<T>> {
        &self.core
    }

    // ========================================================================
    // Transactional operations
    // ========================================================================

    /// Read the value
    pub fn get(&self, tx: &mut Transaction) -> StmResult<T> {
        Ok(tx.open_for_read(self, LockMode::None)?.into_value())
    }

    /// Read the value, holding at least `lock_mode` until the transaction ends
    pub fn get_locked(&self, tx: &mut Transaction, lock_mode: LockMode) -> StmResult<T> {
        Ok(tx.open_for_read(self, lock_mode)?.into_value())
    }

    /// Replace the value
    pub fn set(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        tx.open_for_write(self, LockMode::None)?.set_value(value);
        Ok(())
    }

    /// Replace the value and return the previous one
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        Ok(std::mem::replace(tranlocal.value_mut(), value))
    }

    /// Set `new` if the current value equals `expected`
    ///
    /// A failed comparison leaves only a read behind.
    pub fn compare_and_set(&self, tx: &mut Transaction, expected: &T, new: T) -> StmResult<bool> {
        if self.get(tx)? != *expected {
            return Ok(false);
        }
        self.set(tx, new)?;
        Ok(true)
    }

    /// Apply `function` to the value
    pub fn alter<F: FnOnce(T) -> T>(&self, tx: &mut Transaction, function: F) -> StmResult<()> {
        self.alter_and_get(tx, function).map(|_| ())
    }

    /// Apply `function` and return the new value
    pub fn alter_and_get<F: FnOnce(T) -> T>(
        &self,
        tx: &mut Transaction,
        function: F,
    ) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let altered = function(tranlocal.value().clone());
        tranlocal.set_value(altered.clone());
        Ok(altered)
    }

    /// Apply `function` and return the previous value
    pub fn get_and_alter<F: FnOnce(T) -> T>(
        &self,
        tx: &mut Transaction,
        function: F,
    ) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let previous = tranlocal.value().clone();
        tranlocal.set_value(function(previous.clone()));
        Ok(previous)
    }

    /// Queue `function` to run at commit without reading the value now
    ///
    /// See [`Transaction::commute`].
    pub fn commute<F>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        tx.commute(self, function)
    }

    /// Prevent other transactions from committing a write to this reference
    pub fn ensure(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.open_for_read(self, LockMode::Update).map(|_| ())
    }

    /// Exclude every other transaction from reading or writing this reference
    pub fn privatize(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.open_for_read(self, LockMode::Commit).map(|_| ())
    }

    /// Acquire `lock_mode` on this reference for the rest of the transaction
    pub fn try_lock(&self, tx: &mut Transaction, lock_mode: LockMode) -> StmResult<()> {
        tx.open_for_read(self, lock_mode).map(|_| ())
    }

    /// Block (through retry) until the value equals `expected`
    pub fn await_value(&self, tx: &mut Transaction, expected: &T) -> StmResult<()> {
        if self.get(tx)? != *expected {
            return tx.retry();
        }
        Ok(())
    }

    /// Block (through retry) until `predicate` holds for the value
    pub fn await_until<P: FnOnce(&T) -> bool>(
        &self,
        tx: &mut Transaction,
        predicate: P,
    ) -> StmResult<()> {
        if !predicate(&self.get(tx)?) {
            return tx.retry();
        }
        Ok(())
    }

    // ========================================================================
    // Atomic operations
    // ========================================================================

    /// Read the committed value without a transaction
    ///
    /// # Errors
    ///
    /// `ReadWriteConflict` if the reference stays commit locked past the spin
    /// budget, `IllegalState` if it was never committed.
    pub fn atomic_get(&self) -> StmResult<T> {
        let spin_count = self.core.stm().default_config().spin_count;
        match self.core.atomic_load(spin_count) {
            Ok((value, _)) => Ok(value),
            Err(LoadError::Locked) => Err(StmError::read_conflict(format!(
                "{} is locked",
                self.id()
            ))),
            Err(LoadError::Uncommitted) => Err(StmError::IllegalState(format!(
                "{} was never committed",
                self.id()
            ))),
        }
    }

    /// Replace the committed value in a transaction of its own
    pub fn atomic_set(&self, value: T) -> StmResult<()> {
        self.core
            .stm()
            .atomic_executor()
            .execute(|tx| self.set(tx, value.clone()))
    }

    /// Replace the committed value and return the previous one
    pub fn atomic_get_and_set(&self, value: T) -> StmResult<T> {
        self.core
            .stm()
            .atomic_executor()
            .execute(|tx| self.get_and_set(tx, value.clone()))
    }

    /// Compare-and-set the committed value
    pub fn atomic_compare_and_set(&self, expected: &T, new: T) -> StmResult<bool> {
        self.core
            .stm()
            .atomic_executor()
            .execute(|tx| self.compare_and_set(tx, expected, new.clone()))
    }

    /// Apply `function` to the committed value and return the result
    ///
    /// `function` may run more than once.
    pub fn atomic_alter_and_get<F: Fn(T) -> T>(&self, function: F) -> StmResult<T> {
        self.core
            .stm()
            .atomic_executor()
            .execute(|tx| self.alter_and_get(tx, &function))
    }
}

impl<T> TRef<T>
where
    T: TxnValue + Add<Output = T>,
{
    /// Add `amount` at commit time, without reading the value now
    pub fn increment(&self, tx: &mut Transaction, amount: T) -> StmResult<()> {
        self.commute(tx, move |v| v + amount)
    }

    /// Add `amount` and return the new value
    pub fn increment_and_get(&self, tx: &mut Transaction, amount: T) -> StmResult<T> {
        self.alter_and_get(tx, |v| v + amount)
    }

    /// Add `amount` to the committed value
    pub fn atomic_increment_and_get(&self, amount: T) -> StmResult<T> {
        self.atomic_alter_and_get(|v| v + amount.clone())
    }
}

impl<T> TRef<T>
where
    T: TxnValue + Sub<Output = T>,
{
    /// Subtract `amount` at commit time, without reading the value now
    pub fn decrement(&self, tx: &mut Transaction, amount: T) -> StmResult<()> {
        self.commute(tx, move |v| v - amount)
    }

    /// Subtract `amount` and return the new value
    pub fn decrement_and_get(&self, tx: &mut Transaction, amount: T) -> StmResult<T> {
        self.alter_and_get(tx, |v| v - amount)
    }
}

impl TRef<bool> {
    /// Flip the value and return the new one
    pub fn toggle_and_get(&self, tx: &mut Transaction) -> StmResult<bool> {
        self.alter_and_get(tx, |v| !v)
    }
}

// Identity, not value: two handles are equal if they share the same core
impl<T: TxnValue> PartialEq for TRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: TxnValue> Eq for TRef<T> {}

impl<T: TxnValue> std::hash::Hash for TRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T: TxnValue + std::fmt::Debug> std::fmt::Debug for TRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TRef").field(&*self.core).finish()
    }
}
