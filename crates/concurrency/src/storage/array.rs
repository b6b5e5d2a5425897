//! Fixed-capacity attachment array
//!
//! Linear scan lookup. A hit through `find_mut` moves the attachment to the
//! front, so references touched repeatedly are found after one comparison.

use super::Attachment;
use strata_core::types::RefId;

/// Up to `capacity` attachments in a vector
pub struct ArrayStorage {
    slots: Vec<Attachment>,
    capacity: usize,
}

impl ArrayStorage {
    /// Create an empty array with room for `capacity` attachments
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(super) fn find(&self, id: RefId) -> Option<&Attachment> {
        self.slots.iter().find(|a| a.ref_id() == id)
    }

    pub(super) fn find_mut(&mut self, id: RefId) -> Option<&mut Attachment> {
        let index = self.slots.iter().position(|a| a.ref_id() == id)?;
        if index > 0 {
            self.slots[..=index].rotate_right(1);
        }
        self.slots.first_mut()
    }

    pub(super) fn insert(&mut self, attachment: Attachment) -> Result<(), Attachment> {
        if self.slots.len() >= self.capacity {
            return Err(attachment);
        }
        self.slots.push(attachment);
        Ok(())
    }

    pub(super) fn iter(&self) -> std::slice::Iter<'_, Attachment> {
        self.slots.iter()
    }

    pub(super) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Attachment> {
        self.slots.iter_mut()
    }

    pub(super) fn clear_with<F: FnMut(Attachment)>(&mut self, f: F) {
        self.slots.drain(..).for_each(f);
    }
}
