use std::collections::BTreeMap;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{get_json, put_json, scan_json, PersistenceTransaction, Table};
use crate::firestore::model::{DocumentKey, DocumentKeySet, ResourcePath};
use crate::firestore::mutation::{Mutation, Overlay};

pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// One saved overlay per document with pending writes.
#[derive(Clone, Debug, Default)]
pub struct DocumentOverlayCache;

fn row_key(key: &DocumentKey) -> String {
    key.path().canonical_string()
}

impl DocumentOverlayCache {
    pub fn get_overlay(
        &self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        get_json(txn, Table::DocumentOverlays, &row_key(key))
    }

    pub fn get_overlays<'a>(
        &self,
        txn: &dyn PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> FirestoreResult<OverlayMap> {
        let mut overlays = OverlayMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Saves each mutation as the overlay of its key, tagged with `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut dyn PersistenceTransaction,
        largest_batch_id: i32,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            let overlay = Overlay {
                largest_batch_id,
                mutation: mutation.clone(),
            };
            put_json(txn, Table::DocumentOverlays, &row_key(key), &overlay)?;
        }
        Ok(())
    }

    pub fn remove_overlay(
        &self,
        txn: &mut dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.delete(Table::DocumentOverlays, &row_key(key))
    }

    /// Drops the overlays among `keys` that were produced by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut dyn PersistenceTransaction,
        keys: &DocumentKeySet,
        batch_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                if overlay.largest_batch_id == batch_id {
                    self.remove_overlay(txn, key)?;
                }
            }
        }
        Ok(())
    }

    /// Overlays for documents directly inside `collection` newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &dyn PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> FirestoreResult<OverlayMap> {
        let prefix = format!("{}/", collection.canonical_string());
        Ok(scan_json::<Overlay>(txn, Table::DocumentOverlays, &prefix)?
            .into_iter()
            .map(|(_, overlay)| overlay)
            .filter(|overlay| {
                collection.is_immediate_parent_of(overlay.key().path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|overlay| (overlay.key().clone(), overlay))
            .collect())
    }

    /// Overlays for documents in any collection with id `collection_group`.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &dyn PersistenceTransaction,
        collection_group: &str,
        since_batch_id: i32,
    ) -> FirestoreResult<OverlayMap> {
        Ok(scan_json::<Overlay>(txn, Table::DocumentOverlays, "")?
            .into_iter()
            .map(|(_, overlay)| overlay)
            .filter(|overlay| {
                overlay.key().has_collection_id(collection_group)
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|overlay| (overlay.key().clone(), overlay))
            .collect())
    }
}
