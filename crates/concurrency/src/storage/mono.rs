//! Single-slot attachment storage

use super::Attachment;
use strata_core::types::RefId;

/// Holds at most one attachment
#[derive(Default)]
pub struct MonoStorage {
    slot: Option<Attachment>,
}

impl MonoStorage {
    /// Create an empty slot
    pub fn new() -> Self {
        Self { slot: None }
    }

    pub(super) fn len(&self) -> usize {
        usize::from(self.slot.is_some())
    }

    pub(super) fn find(&self, id: RefId) -> Option<&Attachment> {
        self.slot.as_ref().filter(|a| a.ref_id() == id)
    }

    pub(super) fn find_mut(&mut self, id: RefId) -> Option<&mut Attachment> {
        self.slot.as_mut().filter(|a| a.ref_id() == id)
    }

    pub(super) fn insert(&mut self, attachment: Attachment) -> Result<(), Attachment> {
        if self.slot.is_some() {
            return Err(attachment);
        }
        self.slot = Some(attachment);
        Ok(())
    }

    pub(super) fn iter(&self) -> std::option::Iter<'_, Attachment> {
        self.slot.iter()
    }

    pub(super) fn iter_mut(&mut self) -> std::option::IterMut<'_, Attachment> {
        self.slot.iter_mut()
    }

    pub(super) fn clear_with<F: FnMut(Attachment)>(&mut self, mut f: F) {
        if let Some(attachment) = self.slot.take() {
            f(attachment);
        }
    }
}
