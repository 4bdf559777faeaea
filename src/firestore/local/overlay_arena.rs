use std::collections::BTreeMap;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::DocumentKey;
use crate::firestore::mutation::Overlay;

#[derive(Clone, Debug)]
struct Slot {
    overlay: Option<Overlay>,
    dirty: bool,
}

/// In-memory view of the saved overlays.
///
/// Writes mark keys dirty; a dirty or unknown key is reloaded from the
/// overlay cache on the next read. The arena is cleared whenever a
/// transaction fails so it never holds rolled back state.
#[derive(Debug, Default)]
pub struct OverlayArena {
    slots: BTreeMap<DocumentKey, Slot>,
}

impl OverlayArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, key: &DocumentKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.dirty = true;
        }
    }

    /// Records the overlay that was just written (or removed) for `key`.
    pub fn record(&mut self, key: DocumentKey, overlay: Option<Overlay>) {
        self.slots.insert(key, Slot { overlay, dirty: false });
    }

    pub fn get(
        &mut self,
        txn: &dyn PersistenceTransaction,
        cache: &DocumentOverlayCache,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        if let Some(slot) = self.slots.get(key) {
            if !slot.dirty {
                return Ok(slot.overlay.clone());
            }
        }
        let overlay = cache.get_overlay(txn, key)?;
        self.record(key.clone(), overlay.clone());
        Ok(overlay)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
