//! Error types for the STM
//!
//! Every failure a transaction can report is a variant of [`StmError`].
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into three groups:
//! - Conflicts (`ReadWriteConflict`): the transaction lost a race and may be retried
//! - Control flow (`Retry`, `SpeculativeConfiguration`): signals consumed by the
//!   executor, never meant to reach application code
//! - Misuse (`DeadTransaction`, `Readonly`, `StmMismatch`, ...): programming errors
//!
//! The engine aborts the transaction before returning any of these, so a caller
//! never observes a half-locked transaction after an error.

use crate::types::{StmId, TransactionStatus, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for STM operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Which side of a read/write conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A read could not be performed or validated
    Read,
    /// A write could not be locked or validated
    Write,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Read => f.write_str("read"),
            ConflictKind::Write => f.write_str("write"),
        }
    }
}

/// Transaction feature that only fat transactions provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatFeature {
    /// Deferred commuting updates
    Commute,
    /// Blocking retry with more than one reference read
    MultiReferenceRetry,
    /// Registering an external change listener
    ChangeListener,
}

impl fmt::Display for FatFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FatFeature::Commute => "commute",
            FatFeature::MultiReferenceRetry => "retry on multiple references",
            FatFeature::ChangeListener => "change listener registration",
        };
        f.write_str(name)
    }
}

/// Why a transaction variant is structurally insufficient
///
/// Carried by [`StmError::SpeculativeConfiguration`]. The executor records
/// the requirement and reruns the closure with a richer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speculation {
    /// The attachment storage is full; at least `required` slots are needed
    TooSmall {
        /// Minimum number of attachments the rerun must support
        required: usize,
    },
    /// A lean transaction hit a feature only fat transactions implement
    FatRequired(FatFeature),
}

impl fmt::Display for Speculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speculation::TooSmall { required } => {
                write!(f, "transaction too small, {} attachments required", required)
            }
            Speculation::FatRequired(feature) => {
                write!(f, "fat transaction required for {}", feature)
            }
        }
    }
}

/// Error types for the STM
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StmError {
    /// Lock contention past the spin budget, or a version / conflict counter
    /// mismatch. The transaction has been aborted and may be retried.
    #[error("{kind} conflict: {reason}")]
    ReadWriteConflict {
        /// Read or write side
        kind: ConflictKind,
        /// Human readable cause
        reason: String,
    },

    /// Operation on a transaction that is already aborted or committed
    #[error("transaction {txn} is {status}")]
    DeadTransaction {
        /// Transaction id
        txn: TxnId,
        /// Terminal status it was found in
        status: TransactionStatus,
    },

    /// Mutation attempted after `prepare()`
    #[error("transaction {txn} is already prepared")]
    PreparedTransaction {
        /// Transaction id
        txn: TxnId,
    },

    /// Write, construction or commute on a readonly transaction
    #[error("transaction {txn} is readonly, {operation} is not allowed")]
    Readonly {
        /// Transaction id
        txn: TxnId,
        /// Operation that was refused
        operation: &'static str,
    },

    /// The transaction variant cannot run this closure; rerun with a richer one
    #[error("speculative configuration failure: {0}")]
    SpeculativeConfiguration(Speculation),

    /// `retry()` without a single reference to wait on
    #[error("transaction {txn} cannot block: no tracked reads to wait on")]
    RetryNotPossible {
        /// Transaction id
        txn: TxnId,
    },

    /// `retry()` while blocking is disabled in the configuration
    #[error("transaction {txn} is not allowed to block")]
    RetryNotAllowed {
        /// Transaction id
        txn: TxnId,
    },

    /// The blocking wait of a retry exhausted the configured timeout
    #[error("transaction {txn} timed out waiting for an update")]
    RetryTimeout {
        /// Transaction id
        txn: TxnId,
    },

    /// A reference created by another STM instance was opened
    #[error("reference belongs to stm {found}, transaction runs on stm {expected}")]
    StmMismatch {
        /// STM instance of the transaction
        expected: StmId,
        /// STM instance of the reference
        found: StmId,
    },

    /// Invalid argument (for example constructing an already committed reference)
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation not valid in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Control signal: block until a read reference changes, then rerun
    #[error("retry")]
    Retry,

    /// The executor gave up after exhausting the retry budget
    #[error("transaction family '{family}' gave up after {attempts} attempts")]
    TooManyRetries {
        /// Family name from the configuration
        family: String,
        /// Number of attempts made
        attempts: u32,
    },
}

impl StmError {
    /// Build a read conflict
    pub fn read_conflict(reason: impl Into<String>) -> Self {
        StmError::ReadWriteConflict {
            kind: ConflictKind::Read,
            reason: reason.into(),
        }
    }

    /// Build a write conflict
    pub fn write_conflict(reason: impl Into<String>) -> Self {
        StmError::ReadWriteConflict {
            kind: ConflictKind::Write,
            reason: reason.into(),
        }
    }

    /// True for read/write conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, StmError::ReadWriteConflict { .. })
    }

    /// True for signals the executor consumes instead of surfacing
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StmError::Retry | StmError::SpeculativeConfiguration(_)
        )
    }

    /// True when rerunning the transaction body may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_conflict() || self.is_control_flow()
    }
}
