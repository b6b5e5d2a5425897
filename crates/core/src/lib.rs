//! Core types for the Strata STM
//!
//! This crate defines the foundational types used throughout the system:
//! - StmId, RefId, TxnId: identities of STM instances, references and transactions
//! - TransactionStatus: lifecycle of a transaction
//! - LockMode: pessimistic lock levels
//! - TxnConfig: per-transaction configuration (isolation, locking, retries)
//! - StmError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackoffPolicy, IsolationLevel, TxnConfig};
pub use error::{ConflictKind, FatFeature, Speculation, StmError, StmResult};
pub use types::{
    LockMode, RefId, StmId, TransactionStatus, TxnId, INITIAL_VERSION, VERSION_UNCOMMITTED,
};
