//! STM instance and transaction executor
//!
//! An [`Stm`] owns the global conflict counter shared by all its references
//! and transactions, and the speculative configuration learned per
//! transaction family. It is cheap to clone (one `Arc`).
//!
//! [`TransactionExecutor`] runs a closure to completion:
//!
//! ```text
//! loop {
//!     body(tx) + commit
//!     Retry          -> block until a read changes, next attempt
//!     Speculative    -> remember the requirement, rerun with a richer variant
//!     Conflict       -> backoff, next attempt (until max_retries)
//!     anything else  -> abort and return it
//! }
//! ```

use crate::conflict_counter::GlobalConflictCounter;
use crate::reference::TxnValue;
use crate::speculative::SpeculativeConfiguration;
use crate::transaction::{Transaction, TransactionKind};
use crate::tref::TRef;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use strata_core::config::TxnConfig;
use strata_core::error::{StmError, StmResult};
use strata_core::types::StmId;
use tracing::{debug, trace, warn};

/// Family used by the `atomic_*` operations of references
pub const ATOMIC_FAMILY: &str = "atomic";

struct StmInner {
    id: StmId,
    conflict_counter: GlobalConflictCounter,
    default_config: Arc<TxnConfig>,
    atomic_config: Arc<TxnConfig>,
    speculations: DashMap<String, Arc<SpeculativeConfiguration>>,
}

/// A software transactional memory instance
///
/// References created by one instance can only be opened by transactions
/// of the same instance.
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmInner>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Create an instance with the default transaction configuration
    pub fn new() -> Self {
        Self::build(TxnConfig::default())
    }

    /// Create an instance with `config` as the default transaction configuration
    ///
    /// # Errors
    ///
    /// `IllegalArgument` if the configuration is contradictory.
    pub fn with_config(config: TxnConfig) -> StmResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: TxnConfig) -> Self {
        let atomic_config = config.clone().with_family_name(ATOMIC_FAMILY);
        let stm = Self {
            inner: Arc::new(StmInner {
                id: StmId::new(),
                conflict_counter: GlobalConflictCounter::new(),
                default_config: Arc::new(config),
                atomic_config: Arc::new(atomic_config),
                speculations: DashMap::new(),
            }),
        };
        debug!(target: "strata::stm", stm = %stm.id(), "STM created");
        stm
    }

    /// Unique id of this instance
    pub fn id(&self) -> StmId {
        self.inner.id
    }

    /// Conflict counter shared by every transaction of this instance
    pub fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.inner.conflict_counter
    }

    /// Configuration used when none is given
    pub fn default_config(&self) -> &Arc<TxnConfig> {
        &self.inner.default_config
    }

    /// Create a committed reference holding `value`
    pub fn new_ref<T: TxnValue>(&self, value: T) -> TRef<T> {
        TRef::new(self, value)
    }

    // ========================================================================
    // Manual transactions
    // ========================================================================

    /// Start a fat map transaction with the default configuration
    pub fn start(&self) -> Transaction {
        self.start_with_kind(TransactionKind::fat_map())
    }

    /// Start a transaction of the given kind with the default configuration
    pub fn start_with_kind(&self, kind: TransactionKind) -> Transaction {
        Transaction::new(self.clone(), Arc::clone(&self.inner.default_config), kind)
    }

    /// Start a transaction with its own configuration
    ///
    /// # Errors
    ///
    /// `IllegalArgument` if the configuration is contradictory.
    pub fn start_with(&self, config: TxnConfig, kind: TransactionKind) -> StmResult<Transaction> {
        config.validate()?;
        Ok(Transaction::new(self.clone(), Arc::new(config), kind))
    }

    // ========================================================================
    // Executors
    // ========================================================================

    /// Executor for a transaction family
    ///
    /// Executors of the same family share what they learn about the
    /// transaction shape.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` if the configuration is contradictory.
    pub fn executor(&self, config: TxnConfig) -> StmResult<TransactionExecutor> {
        config.validate()?;
        Ok(self.executor_for(Arc::new(config)))
    }

    /// Executor using the default configuration
    pub fn default_executor(&self) -> TransactionExecutor {
        self.executor_for(Arc::clone(&self.inner.default_config))
    }

    pub(crate) fn atomic_executor(&self) -> TransactionExecutor {
        self.executor_for(Arc::clone(&self.inner.atomic_config))
    }

    fn executor_for(&self, config: Arc<TxnConfig>) -> TransactionExecutor {
        let speculation = Arc::clone(
            self.inner
                .speculations
                .entry(config.family_name.clone())
                .or_insert_with(|| Arc::new(SpeculativeConfiguration::new()))
                .value(),
        );
        TransactionExecutor {
            stm: self.clone(),
            config,
            speculation,
        }
    }

    /// What the STM has learned about `family` so far
    pub fn speculation(&self, family: &str) -> Option<Arc<SpeculativeConfiguration>> {
        self.inner
            .speculations
            .get(family)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Run `body` in a transaction with the default configuration
    ///
    /// # Errors
    ///
    /// See [`TransactionExecutor::execute`].
    ///
    /// # Example
    ///
    /// ```
    /// use strata_concurrency::Stm;
    ///
    /// let stm = Stm::new();
    /// let from = stm.new_ref(100i64);
    /// let to = stm.new_ref(0i64);
    /// stm.atomically(|tx| {
    ///     from.alter(tx, |v| v - 30)?;
    ///     to.alter(tx, |v| v + 30)
    /// })
    /// .unwrap();
    /// assert_eq!(to.atomic_get().unwrap(), 30);
    /// ```
    pub fn atomically<R, F>(&self, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.default_executor().execute(body)
    }

    /// Run `body` with an explicit configuration
    ///
    /// # Errors
    ///
    /// `IllegalArgument` for a contradictory configuration, otherwise see
    /// [`TransactionExecutor::execute`].
    pub fn atomically_with<R, F>(&self, config: TxnConfig, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.executor(config)?.execute(body)
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("id", &self.inner.id)
            .field("conflicts", &self.inner.conflict_counter.count())
            .field("families", &self.inner.speculations.len())
            .finish()
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs closures as transactions of one family until they commit
pub struct TransactionExecutor {
    stm: Stm,
    config: Arc<TxnConfig>,
    speculation: Arc<SpeculativeConfiguration>,
}

impl TransactionExecutor {
    /// Configuration of this executor
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Run `body` until it commits
    ///
    /// `body` may run several times and must not have side effects outside
    /// the transaction.
    ///
    /// # Errors
    ///
    /// - `TooManyRetries` once `max_retries` attempts failed on conflicts or
    ///   retries
    /// - `RetryTimeout` if blocking retries used up the configured timeout
    /// - any non-retryable error returned by `body` or the transaction
    pub fn execute<R, F>(&self, mut body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        let family = &self.config.family_name;
        let mut tx = Transaction::new(
            self.stm.clone(),
            Arc::clone(&self.config),
            self.speculation.kind(&self.config),
        );

        loop {
            let outcome = body(&mut tx).and_then(|value| tx.commit().map(|()| value));
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match error {
                StmError::Retry => {
                    tx.await_update()?;
                }
                StmError::SpeculativeConfiguration(speculation) => {
                    self.speculation.signal(speculation);
                    let kind = self.speculation.kind(&self.config);
                    debug!(
                        target: "strata::stm",
                        family = %family,
                        %speculation,
                        ?kind,
                        "Transaction family reconfigured"
                    );
                    tx.reconfigure(kind);
                }
                error if error.is_conflict() => {
                    trace!(
                        target: "strata::stm",
                        txn = %tx.id(),
                        attempt = tx.attempt(),
                        error = %error,
                        "Transaction conflict"
                    );
                    backoff(self.config.backoff.delay(tx.attempt()));
                }
                error => {
                    tx.abort_quietly();
                    return Err(error);
                }
            }

            if !tx.soft_reset() {
                warn!(
                    target: "strata::stm",
                    family = %family,
                    attempts = tx.attempt(),
                    "Transaction gave up after too many attempts"
                );
                return Err(StmError::TooManyRetries {
                    family: family.clone(),
                    attempts: tx.attempt(),
                });
            }
        }
    }
}

impl std::fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("family", &self.config.family_name)
            .field("kind", &self.speculation.kind(&self.config))
            .finish()
    }
}

fn backoff(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    if delay < Duration::from_micros(10) {
        std::thread::yield_now();
    } else {
        std::thread::sleep(delay);
    }
}

// ============================================================================
// Process-wide instance
// ============================================================================

/// STM instance shared by the whole process
pub static DEFAULT_STM: Lazy<Stm> = Lazy::new(Stm::new);

/// The process-wide STM instance
pub fn default_stm() -> &'static Stm {
    &DEFAULT_STM
}

/// Run `body` on the process-wide STM instance
///
/// # Errors
///
/// See [`TransactionExecutor::execute`].
pub fn atomically<R, F>(body: F) -> StmResult<R>
where
    F: FnMut(&mut Transaction) -> StmResult<R>,
{
    DEFAULT_STM.atomically(body)
}
