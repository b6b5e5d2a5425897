//! Attachment storage strategies
//!
//! A transaction indexes its attached tranlocals by [`RefId`]. The index is
//! the only thing that differs between transaction variants:
//!
//! | kind | lookup | capacity |
//! |------|--------|----------|
//! | `Mono` | one comparison | 1 |
//! | `Array` | linear scan, move-to-front | fixed |
//! | `Map` | open addressing | unbounded |
//!
//! A full storage hands the attachment back from `insert`; the transaction
//! turns that into a speculative "too small" failure.

mod array;
mod map;
mod mono;

pub use array::ArrayStorage;
pub use map::MapStorage;
pub use mono::MonoStorage;

use crate::tranlocal::AttachedTranlocal;
use strata_core::types::RefId;

/// A type-erased attachment
pub type Attachment = Box<dyn AttachedTranlocal>;

/// Storage strategy of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Exactly one attachment
    Mono,
    /// Up to `capacity` attachments, linear scan
    Array {
        /// Maximum number of attachments
        capacity: usize,
    },
    /// Growable hash table
    Map,
}

impl StorageKind {
    /// Maximum number of attachments, `None` if unbounded
    pub fn capacity(&self) -> Option<usize> {
        match self {
            StorageKind::Mono => Some(1),
            StorageKind::Array { capacity } => Some(*capacity),
            StorageKind::Map => None,
        }
    }
}

/// Attachment index of one transaction
pub enum AttachmentStorage {
    /// Single slot
    Mono(MonoStorage),
    /// Fixed array
    Array(ArrayStorage),
    /// Hash table
    Map(MapStorage),
}

impl AttachmentStorage {
    /// Create empty storage of the given kind
    pub fn new(kind: StorageKind) -> Self {
        match kind {
            StorageKind::Mono => AttachmentStorage::Mono(MonoStorage::new()),
            StorageKind::Array { capacity } => {
                AttachmentStorage::Array(ArrayStorage::new(capacity))
            }
            StorageKind::Map => AttachmentStorage::Map(MapStorage::new()),
        }
    }

    /// Strategy of this storage
    pub fn kind(&self) -> StorageKind {
        match self {
            AttachmentStorage::Mono(_) => StorageKind::Mono,
            AttachmentStorage::Array(s) => StorageKind::Array {
                capacity: s.capacity(),
            },
            AttachmentStorage::Map(_) => StorageKind::Map,
        }
    }

    /// Number of attachments
    pub fn len(&self) -> usize {
        match self {
            AttachmentStorage::Mono(s) => s.len(),
            AttachmentStorage::Array(s) => s.len(),
            AttachmentStorage::Map(s) => s.len(),
        }
    }

    /// True if nothing is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `id` is attached
    pub fn contains(&self, id: RefId) -> bool {
        self.find(id).is_some()
    }

    /// Look up an attachment
    pub fn find(&self, id: RefId) -> Option<&Attachment> {
        match self {
            AttachmentStorage::Mono(s) => s.find(id),
            AttachmentStorage::Array(s) => s.find(id),
            AttachmentStorage::Map(s) => s.find(id),
        }
    }

    /// Look up an attachment for mutation
    pub fn find_mut(&mut self, id: RefId) -> Option<&mut Attachment> {
        match self {
            AttachmentStorage::Mono(s) => s.find_mut(id),
            AttachmentStorage::Array(s) => s.find_mut(id),
            AttachmentStorage::Map(s) => s.find_mut(id),
        }
    }

    /// Attach; returns the attachment back if the storage is full
    ///
    /// The caller guarantees `attachment.ref_id()` is not attached yet.
    pub fn insert(&mut self, attachment: Attachment) -> Result<(), Attachment> {
        debug_assert!(!self.contains(attachment.ref_id()));
        match self {
            AttachmentStorage::Mono(s) => s.insert(attachment),
            AttachmentStorage::Array(s) => s.insert(attachment),
            AttachmentStorage::Map(s) => s.insert(attachment),
        }
    }

    /// Iterate over attachments
    pub fn iter(&self) -> Iter<'_> {
        match self {
            AttachmentStorage::Mono(s) => Iter::Mono(s.iter()),
            AttachmentStorage::Array(s) => Iter::Array(s.iter()),
            AttachmentStorage::Map(s) => Iter::Map(s.iter()),
        }
    }

    /// Iterate mutably over attachments
    pub fn iter_mut(&mut self) -> IterMut<'_> {
        match self {
            AttachmentStorage::Mono(s) => IterMut::Mono(s.iter_mut()),
            AttachmentStorage::Array(s) => IterMut::Array(s.iter_mut()),
            AttachmentStorage::Map(s) => IterMut::Map(s.iter_mut()),
        }
    }

    /// Remove every attachment, passing each to `f`
    pub fn clear_with<F: FnMut(Attachment)>(&mut self, f: F) {
        match self {
            AttachmentStorage::Mono(s) => s.clear_with(f),
            AttachmentStorage::Array(s) => s.clear_with(f),
            AttachmentStorage::Map(s) => s.clear_with(f),
        }
    }
}

/// Iterator over attachments
pub enum Iter<'a> {
    #[doc(hidden)]
    Mono(std::option::Iter<'a, Attachment>),
    #[doc(hidden)]
    Array(std::slice::Iter<'a, Attachment>),
    #[doc(hidden)]
    Map(std::iter::Flatten<std::slice::Iter<'a, Option<Attachment>>>),
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Attachment;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Iter::Mono(it) => it.next(),
            Iter::Array(it) => it.next(),
            Iter::Map(it) => it.next(),
        }
    }
}

/// Mutable iterator over attachments
pub enum IterMut<'a> {
    #[doc(hidden)]
    Mono(std::option::IterMut<'a, Attachment>),
    #[doc(hidden)]
    Array(std::slice::IterMut<'a, Attachment>),
    #[doc(hidden)]
    Map(std::iter::Flatten<std::slice::IterMut<'a, Option<Attachment>>>),
}

impl<'a> Iterator for IterMut<'a> {
    type Item = &'a mut Attachment;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IterMut::Mono(it) => it.next(),
            IterMut::Array(it) => it.next(),
            IterMut::Map(it) => it.next(),
        }
    }
}
