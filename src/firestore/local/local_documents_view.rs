use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::{DocumentOverlayCache, OverlayMap};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::overlay_arena::OverlayArena;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::{QueryContext, RemoteDocumentCache, RemoteScan};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, ResourcePath, Timestamp,
};
use crate::firestore::mutation::{
    calculate_overlay_mutation, Mutation, Overlay, OverlayedDocument, BATCH_ID_UNKNOWN,
};

/// Combines cached remote documents with saved overlays to produce the
/// documents the user sees.
#[derive(Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlay_cache: DocumentOverlayCache,
    arena: OverlayArena,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlay_cache: DocumentOverlayCache,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlay_cache,
            arena: OverlayArena::new(),
        }
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    /// Forgets every memoized overlay, e.g. after a rolled back transaction.
    pub fn reset_overlays(&mut self) {
        self.arena.clear();
    }

    pub fn get_overlay(
        &mut self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        self.arena.get(txn, &self.overlay_cache, key)
    }

    fn get_overlays<'a>(
        &mut self,
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

    pub fn save_overlays(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        largest_batch_id: i32,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        self.overlay_cache.save_overlays(txn, largest_batch_id, overlays)?;
        for (key, mutation) in overlays {
            self.arena.record(
                key.clone(),
                Some(Overlay {
                    largest_batch_id,
                    mutation: mutation.clone(),
                }),
            );
        }
        Ok(())
    }

    pub fn remove_overlays_for_batch_id(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        keys: &DocumentKeySet,
        batch_id: i32,
    ) -> FirestoreResult<()> {
        self.overlay_cache
            .remove_overlays_for_batch_id(txn, keys, batch_id)?;
        for key in keys {
            self.arena.mark_dirty(key);
        }
        Ok(())
    }

    /// Local view of one document. Returns an invalid document when neither
    /// the cache nor a pending write knows about it.
    pub fn get_document(
        &mut self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Document> {
        let overlay = self.get_overlay(txn, key)?;
        let mut document = match &overlay {
            Some(overlay) if !matches!(overlay.mutation, Mutation::Patch { .. }) => {
                Document::new_invalid_document(key.clone())
            }
            _ => self.remote_documents.get_entry(txn, key)?,
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'a>(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, documents, &DocumentKeySet::new())
    }

    /// Applies saved overlays to `documents`. Keys in
    /// `existence_state_changed` whose overlay is missing or a patch get their
    /// overlays recomputed from the mutation queue.
    pub fn get_local_view_of_documents(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        documents: DocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        Ok(self
            .compute_views(txn, documents, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Local views along with the fields pending writes touched.
    pub fn get_overlayed_documents(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        documents: DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        self.compute_views(txn, documents, &DocumentKeySet::new())
    }

    fn compute_views(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        documents: DocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.get_overlays(txn, documents.keys())?;
        let mut recalculate = DocumentMap::new();
        let mut views = BTreeMap::new();
        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let needs_recalculation = existence_state_changed.contains(&key)
                && overlay.map_or(true, |overlay| matches!(overlay.mutation, Mutation::Patch { .. }));
            if needs_recalculation {
                recalculate.insert(key, document);
                continue;
            }
            let mutated_fields = match overlay {
                Some(overlay) => {
                    let mask = overlay.mutation.field_mask().cloned();
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, mask.clone(), Timestamp::now());
                    mask
                }
                None => Some(FieldMask::empty()),
            };
            views.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }

        let masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        for (key, document) in recalculate {
            let mutated_fields = masks.get(&key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
            views.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }
        Ok(views)
    }

    /// Replays every queued batch touching `documents` on top of them and
    /// saves the resulting overlays. Keys no batch touches lose their overlay.
    ///
    /// `documents` is updated in place to the local view.
    pub fn recalculate_and_save_overlays(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        documents: &mut DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_keys(txn, &keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<i32, DocumentKeySet> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, mask);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = DocumentKeySet::new();
        let mut cleared = DocumentKeySet::new();
        for (batch_id, batch_keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let computed = documents
                    .get(key)
                    .zip(masks.get(key))
                    .and_then(|(document, mask)| calculate_overlay_mutation(document, mask.as_ref()));
                match computed {
                    Some(mutation) => {
                        overlays.insert(key.clone(), mutation);
                    }
                    None => {
                        cleared.insert(key.clone());
                    }
                }
            }
            self.save_overlays(txn, *batch_id, &overlays)?;
        }

        let stale = keys
            .iter()
            .filter(|key| !processed.contains(*key))
            .chain(cleared.iter());
        for key in stale {
            self.overlay_cache.remove_overlay(txn, key)?;
            self.arena.record(key.clone(), None);
        }
        Ok(masks)
    }

    /// Recomputes and saves the overlays of `keys` from their cached state.
    pub fn recalculate_overlays_for_keys(
        &mut self,
        txn: &mut dyn PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Documents matching `query` in their local view.
    pub fn get_documents_matching_query(
        &mut self,
        txn: &dyn PersistenceTransaction,
        query: &Query,
        scan: RemoteScan,
        context: &mut QueryContext,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut results = DocumentMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return Ok(results);
        }

        if let Some(collection_id) = query.collection_group_id() {
            let collection_id = collection_id.to_string();
            let mut results = DocumentMap::new();
            let parents = self
                .remote_documents
                .collection_parents()
                .get_collection_parents(txn, &collection_id)?;
            for parent in parents {
                let collection_query =
                    query.as_collection_query_at_path(parent.child([collection_id.as_str()]));
                results.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    scan,
                    context,
                )?);
            }
            return Ok(results);
        }

        self.get_documents_matching_collection_query(txn, query, scan, context)
    }

    fn get_documents_matching_collection_query(
        &mut self,
        txn: &dyn PersistenceTransaction,
        query: &Query,
        scan: RemoteScan,
        context: &mut QueryContext,
    ) -> FirestoreResult<DocumentMap> {
        let collection: &ResourcePath = query.path();
        let overlays =
            self.overlay_cache
                .get_overlays_for_collection(txn, collection, BATCH_ID_UNKNOWN)?;
        let overlay_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut documents = self.remote_documents.get_documents_matching_query(
            txn,
            collection,
            query,
            scan,
            &overlay_keys,
            context,
        )?;
        for key in &overlay_keys {
            if !documents.contains_key(key) {
                let document = self.remote_documents.get_entry(txn, key)?;
                documents.insert(key.clone(), document);
            }
        }

        let mut results = DocumentMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay.mutation.apply_to_local_view(
                    &mut document,
                    Some(FieldMask::empty()),
                    Timestamp::now(),
                );
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }
}
