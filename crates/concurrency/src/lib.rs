//! Software transactional memory for Strata
//!
//! This crate implements the STM engine:
//! - Orec: per-reference ownership record (version, locks, reader surplus)
//! - RefCore / TRef: transactional references with epoch-reclaimed snapshots
//! - Transaction: lean and fat variants over mono, array and map storage
//! - TransactionExecutor: retry loop with backoff, blocking retry and
//!   speculative reconfiguration
//!
//! Conflicts are detected per reference through version checks, and cheaply
//! across references through a global conflict counter that only moves when
//! a commit may invalidate someone else's read.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict_counter;
pub mod latch;
pub mod listeners;
pub mod orec;
pub mod pool;
pub mod reference;
pub mod speculative;
pub mod stm;
pub mod storage;
pub mod tranlocal;
pub mod transaction;
pub mod tref;

pub use conflict_counter::{GlobalConflictCounter, LocalConflictCounter};
pub use latch::Latch;
pub use listeners::Listeners;
pub use orec::{Arrival, Orec, READ_BIASED_THRESHOLD};
pub use pool::TranlocalPool;
pub use reference::{RefCore, Registration, TxnValue};
pub use speculative::SpeculativeConfiguration;
pub use stm::{atomically, default_stm, Stm, TransactionExecutor, ATOMIC_FAMILY, DEFAULT_STM};
pub use storage::StorageKind;
pub use tranlocal::{DirtyState, Tranlocal, TranlocalStatus};
pub use transaction::{ReadView, Transaction, TransactionKind};
pub use tref::{BooleanRef, DoubleRef, IntRef, LongRef, Ref, TRef};
