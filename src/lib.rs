//! Strata STM - software transactional memory for Rust
//!
//! Shared state lives in transactional references ([`TRef`]). Closures run
//! against them inside transactions and either commit atomically or are
//! rerun; no locks are visible to the application.
//!
//! # Quick Start
//!
//! ```
//! use strata_stm::{Stm, StmResult};
//!
//! let stm = Stm::new();
//! let checking = stm.new_ref(100i64);
//! let savings = stm.new_ref(0i64);
//!
//! let moved: StmResult<i64> = stm.atomically(|tx| {
//!     let amount = checking.get(tx)? / 2;
//!     checking.alter(tx, |v| v - amount)?;
//!     savings.alter(tx, |v| v + amount)?;
//!     Ok(amount)
//! });
//!
//! assert_eq!(moved.unwrap(), 50);
//! assert_eq!(savings.atomic_get().unwrap(), 50);
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: ids, configuration and the error taxonomy
//! - `strata-concurrency`: orecs, references, transactions and the executor
//!
//! This crate re-exports both.

pub use strata_concurrency::*;
pub use strata_core::{
    BackoffPolicy, ConflictKind, FatFeature, IsolationLevel, LockMode, RefId, Speculation,
    StmError, StmId, StmResult, TransactionStatus, TxnConfig, TxnId, INITIAL_VERSION,
    VERSION_UNCOMMITTED,
};
