//! Core identity and lifecycle types for the STM
//!
//! This module defines the foundational types:
//! - StmId: Identity of an STM instance (references may not cross instances)
//! - RefId: Identity of a transactional reference
//! - TxnId: Identity of a transaction, used as orec lock owner
//! - TransactionStatus: Lifecycle state of a transaction
//! - LockMode: Pessimistic lock level requested on a reference

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Version of a reference that has been created inside a transaction but
/// never committed.
pub const VERSION_UNCOMMITTED: u64 = 0;

/// Version given to a reference created already committed.
pub const INITIAL_VERSION: u64 = 1;

/// Unique identifier for an STM instance
///
/// A StmId is a wrapper around a UUID v4. Every reference remembers the
/// instance that created it; a transaction refuses references that belong
/// to a different instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StmId(Uuid);

impl StmId {
    /// Create a new random StmId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a StmId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this StmId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for StmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a transactional reference
///
/// Allocated from a process-wide counter, so two live references never share
/// an id. Attachment tables and tranlocal pools are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId(u64);

impl RefId {
    /// Allocate the next reference id
    pub fn next() -> Self {
        Self(NEXT_REF_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Identity of a transaction
///
/// Zero is reserved to mean "no owner" inside ownership records, so
/// allocated ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Allocate the next transaction id
    pub fn next() -> Self {
        Self(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id from its raw value; `0` yields `None`
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw numeric value (never zero)
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Status of a transaction in its lifecycle
///
/// State transitions:
/// - `Active` → `Prepared` (all writes locked and validated)
/// - `Active` | `Prepared` → `Committed` (writes published)
/// - `Active` | `Prepared` → `Aborted` (locks released, writes discarded)
///
/// Terminal states (only a reset brings the transaction back to `Active`):
/// - `Committed`
/// - `Aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Transaction is executing, can open references
    Active,
    /// Transaction holds all locks needed to commit
    Prepared,
    /// Transaction was aborted
    Aborted,
    /// Transaction committed successfully
    Committed,
}

impl TransactionStatus {
    /// Active or Prepared
    pub fn is_alive(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Prepared)
    }

    /// Aborted or Committed
    pub fn is_dead(&self) -> bool {
        !self.is_alive()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Aborted => "aborted",
            TransactionStatus::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Pessimistic lock level on a reference
///
/// Ordered: `None < Update < Commit`. An update lock keeps other writers out
/// but still lets readers arrive; a commit lock excludes readers as well.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum LockMode {
    /// No lock, optimistic access
    #[default]
    None,
    /// Other transactions may read but not write
    Update,
    /// Exclusive: other transactions may neither read nor write
    Commit,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "none",
            LockMode::Update => "update",
            LockMode::Commit => "commit",
        };
        f.write_str(name)
    }
}
