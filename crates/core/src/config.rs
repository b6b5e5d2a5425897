//! Transaction configuration
//!
//! A [`TxnConfig`] is immutable once a transaction starts. It is shared
//! between all transactions of one executor through an `Arc`.
//!
//! Every field has a serde default, so a partial JSON document is a valid
//! configuration:
//!
//! ```json
//! { "family_name": "transfer", "isolation_level": "serializable" }
//! ```

use crate::error::{StmError, StmResult};
use crate::types::LockMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Isolation
// ============================================================================

/// Isolation level of a transaction
///
/// Both levels prevent dirty reads and lost updates. They differ in whether
/// reads are validated at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Writes are validated at prepare; reads are not. Write skew is possible.
    #[default]
    ReadCommitted,
    /// Reads are locked and validated at prepare as well. Write skew is rejected.
    Serializable,
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff applied between attempts after a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first conflict, in nanoseconds
    #[serde(default = "default_min_delay_ns")]
    pub min_delay_ns: u64,
    /// Upper bound of the delay, in nanoseconds
    #[serde(default = "default_max_delay_ns")]
    pub max_delay_ns: u64,
}

fn default_min_delay_ns() -> u64 {
    100
}

fn default_max_delay_ns() -> u64 {
    1_000_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay_ns: default_min_delay_ns(),
            max_delay_ns: default_max_delay_ns(),
        }
    }
}

impl BackoffPolicy {
    /// Backoff that never waits
    pub fn none() -> Self {
        Self {
            min_delay_ns: 0,
            max_delay_ns: 0,
        }
    }

    /// Calculate delay for a given attempt (exponential backoff)
    ///
    /// Attempt 1 is the first retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        // Cap the shift to prevent overflow
        let shift = attempt.saturating_sub(1).min(63);
        let delay = self.min_delay_ns.saturating_mul(1u64 << shift);
        Duration::from_nanos(delay.min(self.max_delay_ns))
    }
}

// ============================================================================
// Transaction configuration
// ============================================================================

/// Configuration consumed by transactions and executors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Name of the transaction family, used for diagnostics and to key the
    /// learned speculative configuration
    #[serde(default = "default_family_name")]
    pub family_name: String,
    /// Refuse writes, construction and commute
    #[serde(default)]
    pub readonly: bool,
    /// Isolation level
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Lock acquired on every read
    #[serde(default)]
    pub read_lock_mode: LockMode,
    /// Lock acquired on every write (at least the read lock mode)
    #[serde(default)]
    pub write_lock_mode: LockMode,
    /// Skip publishing writes whose value equals the value read
    #[serde(default = "default_true")]
    pub dirty_check: bool,
    /// Number of spins on a locked orec before reporting a conflict
    #[serde(default = "default_spin_count")]
    pub spin_count: u32,
    /// Whether `retry()` may block the calling thread
    #[serde(default = "default_true")]
    pub blocking_allowed: bool,
    /// Total time a transaction may spend blocked in retries; `None` waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ns: Option<u64>,
    /// Maximum number of attempts before the executor gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Attach every read (fat transactions only may skip this for read biased
    /// references)
    #[serde(default = "default_true")]
    pub track_reads: bool,
    /// Start with the smallest lean variant and grow on demand
    #[serde(default = "default_true")]
    pub speculative_config_enabled: bool,
    /// Capacity of array transactions before switching to the map variant
    #[serde(default = "default_max_array_capacity")]
    pub max_array_capacity: usize,
    /// Backoff between conflicting attempts
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_family_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_spin_count() -> u32 {
    64
}

fn default_max_retries() -> u32 {
    1000
}

fn default_max_array_capacity() -> usize {
    20
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            family_name: default_family_name(),
            readonly: false,
            isolation_level: IsolationLevel::default(),
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            dirty_check: true,
            spin_count: default_spin_count(),
            blocking_allowed: true,
            timeout_ns: None,
            max_retries: default_max_retries(),
            track_reads: true,
            speculative_config_enabled: true,
            max_array_capacity: default_max_array_capacity(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl TxnConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the configuration for contradictions
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` if:
    /// - the family name is empty
    /// - `write_lock_mode` is weaker than `read_lock_mode`
    /// - a readonly configuration asks for write locks
    /// - `max_retries` or `max_array_capacity` is zero
    /// - the backoff bounds are inverted
    pub fn validate(&self) -> StmResult<()> {
        if self.family_name.is_empty() {
            return Err(StmError::IllegalArgument(
                "family_name must not be empty".to_string(),
            ));
        }
        if self.write_lock_mode < self.read_lock_mode {
            return Err(StmError::IllegalArgument(format!(
                "write_lock_mode {} is weaker than read_lock_mode {}",
                self.write_lock_mode, self.read_lock_mode
            )));
        }
        if self.readonly && self.write_lock_mode != LockMode::None {
            return Err(StmError::IllegalArgument(
                "readonly transactions cannot request write locks".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(StmError::IllegalArgument(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_array_capacity == 0 {
            return Err(StmError::IllegalArgument(
                "max_array_capacity must be at least 1".to_string(),
            ));
        }
        if self.backoff.min_delay_ns > self.backoff.max_delay_ns {
            return Err(StmError::IllegalArgument(format!(
                "backoff min_delay_ns {} exceeds max_delay_ns {}",
                self.backoff.min_delay_ns, self.backoff.max_delay_ns
            )));
        }
        Ok(())
    }

    /// Set the family name
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Make transactions readonly
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Set the isolation level
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Lock acquired on every read; raises the write lock mode along with it
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self.write_lock_mode = self.write_lock_mode.max(mode);
        self
    }

    /// Lock acquired on every write
    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    /// Enable or disable the dirty check
    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    /// Set the spin budget on locked orecs
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Allow or forbid blocking retries
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Bound the total time spent blocked in retries
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ns = Some(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX));
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable read tracking
    pub fn with_track_reads(mut self, track_reads: bool) -> Self {
        self.track_reads = track_reads;
        self
    }

    /// Enable or disable speculative (lean first) configuration
    pub fn with_speculative_config(mut self, enabled: bool) -> Self {
        self.speculative_config_enabled = enabled;
        self
    }

    /// Set the capacity of array transactions
    pub fn with_max_array_capacity(mut self, capacity: usize) -> Self {
        self.max_array_capacity = capacity;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// True for `Serializable`
    pub fn is_serializable(&self) -> bool {
        self.isolation_level == IsolationLevel::Serializable
    }
}
