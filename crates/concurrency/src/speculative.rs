//! Learned transaction shape per family
//!
//! Executors start a family with the cheapest variant (lean, one reference)
//! and grow it whenever a run fails with a speculative configuration error.
//! What was learned only ever grows, so a family settles on the smallest
//! variant that fits its closure after a few runs.

use crate::storage::StorageKind;
use crate::transaction::TransactionKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strata_core::config::TxnConfig;
use strata_core::error::Speculation;

/// Monotonic record of what a transaction family needs
#[derive(Debug)]
pub struct SpeculativeConfiguration {
    min_capacity: AtomicUsize,
    fat: AtomicBool,
}

impl Default for SpeculativeConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeculativeConfiguration {
    /// Nothing learned yet: lean, one reference
    pub fn new() -> Self {
        Self {
            min_capacity: AtomicUsize::new(1),
            fat: AtomicBool::new(false),
        }
    }

    /// Number of attachments the family needs at least
    pub fn min_capacity(&self) -> usize {
        self.min_capacity.load(Ordering::Acquire)
    }

    /// True once the family needed a fat-only feature
    pub fn is_fat(&self) -> bool {
        self.fat.load(Ordering::Acquire)
    }

    /// Record a speculative failure
    pub fn signal(&self, speculation: Speculation) {
        match speculation {
            Speculation::TooSmall { required } => {
                self.min_capacity.fetch_max(required, Ordering::AcqRel);
            }
            Speculation::FatRequired(_) => self.fat.store(true, Ordering::Release),
        }
    }

    /// Variant the next run of the family should use
    ///
    /// Without speculation every run uses the fat map variant.
    pub fn kind(&self, config: &TxnConfig) -> TransactionKind {
        if !config.speculative_config_enabled {
            return TransactionKind::fat_map();
        }

        let required = self.min_capacity();
        let storage = if required <= 1 {
            StorageKind::Mono
        } else if required <= config.max_array_capacity {
            StorageKind::Array {
                capacity: config.max_array_capacity,
            }
        } else {
            StorageKind::Map
        };
        TransactionKind {
            storage,
            fat: self.is_fat(),
        }
    }
}
