//! Open-addressed attachment table
//!
//! Identity hashing with `FxHasher`, linear probing, doubling rehash once the
//! table is three quarters full. Attachments are never removed individually;
//! the whole table is cleared at the end of an attempt, so probe chains never
//! contain holes.

use super::Attachment;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use strata_core::types::RefId;

const INITIAL_CAPACITY: usize = 16;

/// Unbounded attachment table
pub struct MapStorage {
    slots: Vec<Option<Attachment>>,
    len: usize,
}

impl Default for MapStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn hash(id: RefId) -> usize {
    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    hasher.finish() as usize
}

impl MapStorage {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            slots: empty_slots(INITIAL_CAPACITY),
            len: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    /// Number of slots currently allocated
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn index_of(&self, id: RefId) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut index = hash(id) & mask;
        loop {
            match &self.slots[index] {
                None => return None,
                Some(a) if a.ref_id() == id => return Some(index),
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    pub(super) fn find(&self, id: RefId) -> Option<&Attachment> {
        let index = self.index_of(id)?;
        self.slots[index].as_ref()
    }

    pub(super) fn find_mut(&mut self, id: RefId) -> Option<&mut Attachment> {
        let index = self.index_of(id)?;
        self.slots[index].as_mut()
    }

    pub(super) fn insert(&mut self, attachment: Attachment) -> Result<(), Attachment> {
        if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        self.place(attachment);
        self.len += 1;
        Ok(())
    }

    fn place(&mut self, attachment: Attachment) {
        let mask = self.slots.len() - 1;
        let mut index = hash(attachment.ref_id()) & mask;
        while self.slots[index].is_some() {
            index = (index + 1) & mask;
        }
        self.slots[index] = Some(attachment);
    }

    fn grow(&mut self) {
        let doubled = empty_slots(self.slots.len() * 2);
        let old = std::mem::replace(&mut self.slots, doubled);
        for attachment in old.into_iter().flatten() {
            self.place(attachment);
        }
    }

    pub(super) fn iter(&self) -> std::iter::Flatten<std::slice::Iter<'_, Option<Attachment>>> {
        self.slots.iter().flatten()
    }

    pub(super) fn iter_mut(
        &mut self,
    ) -> std::iter::Flatten<std::slice::IterMut<'_, Option<Attachment>>> {
        self.slots.iter_mut().flatten()
    }

    pub(super) fn clear_with<F: FnMut(Attachment)>(&mut self, mut f: F) {
        if self.len == 0 {
            return;
        }
        for slot in self.slots.iter_mut() {
            if let Some(attachment) = slot.take() {
                f(attachment);
            }
        }
        self.len = 0;
    }
}

fn empty_slots(capacity: usize) -> Vec<Option<Attachment>> {
    (0..capacity).map(|_| None).collect()
}
