//! Transaction-private tranlocal pool
//!
//! Eliminates allocation overhead by reusing tranlocal boxes across the
//! attempts of one transaction. After a commit or abort every attachment is
//! handed back here; the next open of a reference with the same value type
//! reinitializes a pooled box in place instead of allocating.
//!
//! A pooled tranlocal is owned by the pool alone. It never becomes the
//! committed snapshot of a reference: publication moves the value into a
//! fresh snapshot node, so recycling cannot leak into what readers observe.

use crate::reference::{Loaded, RefCore, TxnValue};
use crate::tranlocal::{Tranlocal, TranlocalStatus};
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Maximum pooled tranlocals per value type
pub const MAX_POOLED_PER_TYPE: usize = 16;

/// Free lists of tranlocal boxes keyed by value type
#[derive(Default)]
pub struct TranlocalPool {
    free: FxHashMap<TypeId, Vec<Box<dyn Any + Send>>>,
    pooled: usize,
}

impl TranlocalPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a tranlocal box for reuse
    ///
    /// Dropped if the free list of its type is full.
    pub(crate) fn put(&mut self, key: TypeId, tranlocal: Box<dyn Any + Send>) {
        let list = self.free.entry(key).or_default();
        if list.len() < MAX_POOLED_PER_TYPE {
            list.push(tranlocal);
            self.pooled += 1;
        }
    }

    /// Build a tranlocal from a load, reusing a pooled box when available
    pub(crate) fn tranlocal<T: TxnValue>(
        &mut self,
        owner: Arc<RefCore<T>>,
        loaded: Loaded<T>,
        status: TranlocalStatus,
    ) -> Box<Tranlocal<T>> {
        let pooled = self
            .free
            .get_mut(&TypeId::of::<Tranlocal<T>>())
            .and_then(|list| list.pop());

        if let Some(boxed) = pooled {
            self.pooled -= 1;
            if let Ok(mut tranlocal) = boxed.downcast::<Tranlocal<T>>() {
                tranlocal.reinit(owner, loaded, status);
                return tranlocal;
            }
        }
        Box::new(Tranlocal::from_loaded(owner, loaded, status))
    }

    /// Number of pooled tranlocals
    pub fn len(&self) -> usize {
        self.pooled
    }

    /// True if nothing is pooled
    pub fn is_empty(&self) -> bool {
        self.pooled == 0
    }

    /// Drop every pooled tranlocal
    pub fn clear(&mut self) {
        self.free.clear();
        self.pooled = 0;
    }
}

impl std::fmt::Debug for TranlocalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranlocalPool")
            .field("pooled", &self.pooled)
            .field("types", &self.free.len())
            .finish()
    }
}
