//! The local store: the single entry point the sync engine uses to read and
//! write cached state.
//!
//! Every operation runs inside one persistence transaction. In-memory target
//! bookkeeping is only updated after that transaction commits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::firestore::core::{ChangeType, Query, Target, ViewSnapshot};
use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{
    run_transaction, Persistence, PersistenceTransaction, TransactionMode,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion, Timestamp,
};
use crate::firestore::mutation::{
    Mutation, MutationBatch, MutationBatchResult, Precondition, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::RemoteEvent;
use crate::firestore::settings::FirestoreSettings;

/// Resume tokens older than this are persisted even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Outcome of queuing a batch of local writes.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    /// Local views of every document the batch touched.
    pub changes: DocumentMap,
}

/// Cached documents for a query along with the keys the server last
/// reported for its target.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Documents that entered or left a view, reported back after a snapshot
/// has been raised.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: i32, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

struct LocalStoreState {
    documents: LocalDocumentsView,
    target_cache: TargetCache,
    targets: BTreeMap<i32, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, i32>,
    local_view_references: ReferenceSet,
}

pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    eager_gc: bool,
    query_engine: QueryEngine,
    state: StdMutex<LocalStoreState>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("persistence", &self.persistence.name())
            .field("eager_gc", &self.eager_gc)
            .finish()
    }
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        settings: &FirestoreSettings,
    ) -> FirestoreResult<Self> {
        let index_manager = Arc::new(IndexManager::new(settings.field_indexes.iter().cloned()));
        let remote_documents = RemoteDocumentCache::new(index_manager.clone());
        let store = Self {
            persistence,
            eager_gc: settings.garbage_collection.eager,
            query_engine: QueryEngine::new(settings.query_engine.clone(), index_manager.clone()),
            state: StdMutex::new(LocalStoreState {
                documents: LocalDocumentsView::new(
                    remote_documents,
                    MutationQueue,
                    DocumentOverlayCache,
                ),
                target_cache: TargetCache,
                targets: BTreeMap::new(),
                target_ids_by_canonical_id: BTreeMap::new(),
                local_view_references: ReferenceSet::new(),
            }),
        };
        store.run("start local store", TransactionMode::ReadWrite, |state, txn| {
            let parents = state.documents.remote_documents().collection_parents().clone();
            for index in index_manager.field_indexes()? {
                index_manager.backfill(txn, &parents, &index)?;
            }
            Ok(())
        })?;
        log::debug!("local store started on {} persistence", store.persistence.name());
        Ok(store)
    }

    pub fn persistence_name(&self) -> &'static str {
        self.persistence.name()
    }

    fn lock_state(&self) -> FirestoreResult<MutexGuard<'_, LocalStoreState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("local store state lock poisoned"))
    }

    fn run<T, F>(&self, action: &str, mode: TransactionMode, work: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut LocalStoreState, &mut dyn PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut state = self.lock_state()?;
        let result = run_transaction(self.persistence.as_ref(), action, mode, |txn| {
            work(&mut state, txn)
        });
        if result.is_err() {
            state.documents.reset_overlays();
        }
        result
    }

    /// Queues `mutations` as one batch and returns the new local views.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument("a write batch must contain at least one mutation"));
        }
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();
        self.run("Locally write mutations", TransactionMode::ReadWrite, |state, txn| {
            let remote_docs = state.documents.remote_documents().get_entries(txn, &keys)?;
            let docs_without_remote_version: DocumentKeySet = remote_docs
                .iter()
                .filter(|(_, document)| !document.is_valid_document())
                .map(|(key, _)| key.clone())
                .collect();
            let mut overlayed = state.documents.get_overlayed_documents(txn, remote_docs)?;

            let mut base_mutations = Vec::new();
            for mutation in &mutations {
                let Some(current) = overlayed.get(mutation.key()) else {
                    continue;
                };
                if let Some(base_value) = mutation.extract_transform_base_value(&current.document) {
                    let mask = base_value.field_mask();
                    base_mutations.push(
                        Mutation::patch(mutation.key().clone(), base_value, mask)
                            .with_precondition(Precondition::Exists(true)),
                    );
                }
            }

            let batch = state.documents.mutation_queue().add_mutation_batch(
                txn,
                local_write_time,
                base_mutations,
                mutations,
            )?;
            let overlays =
                batch.apply_to_local_document_set(&mut overlayed, &docs_without_remote_version);
            state.documents.save_overlays(txn, batch.batch_id, &overlays)?;
            log::debug!("queued batch {} with {} writes", batch.batch_id, batch.mutations.len());
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: overlayed
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.document))
                    .collect(),
            })
        })
    }

    /// Applies a server acknowledgement: the committed writes become part of
    /// the remote cache and the batch leaves the queue.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.run("Acknowledge batch", TransactionMode::ReadWrite, |state, txn| {
            let batch = &result.batch;
            let affected = batch.keys();
            state
                .documents
                .mutation_queue()
                .acknowledge_batch(txn, batch, result.stream_token.clone())?;

            for key in &affected {
                let mut document = state.documents.remote_documents().get_entry(txn, key)?;
                let Some(ack_version) = result.doc_versions.get(key) else {
                    return Err(internal_error(format!("no ack version for {key}")));
                };
                if document.version() < *ack_version {
                    batch.apply_to_remote_document(&mut document, result);
                    if document.is_valid_document() {
                        state.documents.remote_documents().add_entry(
                            txn,
                            &document,
                            result.commit_version,
                        )?;
                    }
                }
            }

            state.documents.mutation_queue().remove_mutation_batch(txn, batch)?;
            state
                .documents
                .remove_overlays_for_batch_id(txn, &affected, batch.batch_id)?;

            let with_transform_results: DocumentKeySet = batch
                .mutations
                .iter()
                .zip(result.mutation_results.iter())
                .filter(|(_, mutation_result)| !mutation_result.transform_results.is_empty())
                .map(|(mutation, _)| mutation.key().clone())
                .collect();
            state
                .documents
                .recalculate_overlays_for_keys(txn, &with_transform_results)?;
            state.documents.get_documents(txn, &affected)
        })
    }

    /// Removes a batch the server refused and returns the restored local views.
    pub fn reject_batch(&self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        self.run("Reject batch", TransactionMode::ReadWrite, |state, txn| {
            let Some(batch) = state
                .documents
                .mutation_queue()
                .lookup_mutation_batch(txn, batch_id)?
            else {
                return Err(internal_error(format!("attempt to reject unknown batch {batch_id}")));
            };
            let affected = batch.keys();
            state.documents.mutation_queue().remove_mutation_batch(txn, &batch)?;
            state
                .documents
                .remove_overlays_for_batch_id(txn, &affected, batch_id)?;
            state.documents.recalculate_overlays_for_keys(txn, &affected)?;
            state.documents.get_documents(txn, &affected)
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32> {
        self.run("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |state, txn| {
            state.documents.mutation_queue().highest_unacknowledged_batch_id(txn)
        })
    }

    /// First queued batch after `after_batch_id` (or the head of the queue).
    pub fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        self.run("Get next mutation batch", TransactionMode::ReadOnly, |state, txn| {
            state
                .documents
                .mutation_queue()
                .next_mutation_batch_after(txn, after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
        })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.run("Get last stream token", TransactionMode::ReadOnly, |state, txn| {
            state.documents.mutation_queue().last_stream_token(txn)
        })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.run("Set last stream token", TransactionMode::ReadWrite, |state, txn| {
            state
                .documents
                .mutation_queue()
                .set_last_stream_token(txn, stream_token)
        })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run("Get last remote snapshot version", TransactionMode::ReadOnly, |state, txn| {
            state.target_cache.last_remote_snapshot_version(txn)
        })
    }

    /// Folds a consistent watch snapshot into the cache and returns the
    /// local views of every changed document.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let (changes, updated_targets) =
            self.run("Apply remote event", TransactionMode::ReadWrite, |state, txn| {
                let sequence_number = state.target_cache.next_sequence_number(txn)?;
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &event.target_changes {
                    let Some(old) = state.targets.get(target_id) else {
                        // Late data for a released target.
                        continue;
                    };
                    state
                        .target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    state
                        .target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut updated = old.clone().with_sequence_number(sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(old, &updated, change) {
                        state.target_cache.update_target_data(txn, &updated)?;
                    }
                    updated_targets.insert(*target_id, updated);
                }

                let updated_keys: DocumentKeySet =
                    event.document_updates.keys().cloned().collect();
                let existing = state
                    .documents
                    .remote_documents()
                    .get_entries(txn, &updated_keys)?;
                let mut changed = DocumentMap::new();
                let mut existence_changed = DocumentKeySet::new();
                for (key, document) in &event.document_updates {
                    let Some(existing) = existing.get(key) else {
                        continue;
                    };
                    if document.is_found_document() != existing.is_found_document() {
                        existence_changed.insert(key.clone());
                    }
                    if document.is_no_document() && document.version().is_min() {
                        // Deletion from a limbo resolution or a query we cannot
                        // prove anything about: forget the cached state.
                        state.documents.remote_documents().remove_entry(txn, key)?;
                        changed.insert(key.clone(), document.clone());
                    } else if !existing.is_valid_document()
                        || document.version() > existing.version()
                        || (document.version() == existing.version()
                            && existing.has_pending_writes())
                    {
                        state
                            .documents
                            .remote_documents()
                            .add_entry(txn, document, remote_version)?;
                        changed.insert(key.clone(), document.clone());
                    } else {
                        log::debug!(
                            "ignoring outdated watch update for {key}: current version {}, watch version {}",
                            existing.version(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last = state.target_cache.last_remote_snapshot_version(txn)?;
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "watch stream reverted to snapshot {remote_version} from {last}"
                        )));
                    }
                    state
                        .target_cache
                        .set_last_remote_snapshot_version(txn, remote_version)?;
                }

                let views = state
                    .documents
                    .get_local_view_of_documents(txn, changed, &existence_changed)?;
                Ok((views, updated_targets))
            })?;

        let mut state = self.lock_state()?;
        for (target_id, target_data) in updated_targets {
            state.targets.insert(target_id, target_data);
        }
        Ok(changes)
    }

    /// Records which documents each view now shows and advances the
    /// limbo-free snapshot version of views that are in sync.
    pub fn notify_local_view_changes(&self, changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.run("Notify local view changes", TransactionMode::ReadWrite, |state, txn| {
            for change in changes {
                state
                    .local_view_references
                    .add_references(&change.added_keys, change.target_id);
                state
                    .local_view_references
                    .remove_references(&change.removed_keys, change.target_id);
                if change.from_cache {
                    continue;
                }
                let Some(target_data) = state.targets.get(&change.target_id) else {
                    continue;
                };
                let version = target_data.snapshot_version;
                let updated = target_data
                    .clone()
                    .with_last_limbo_free_snapshot_version(version);
                state.target_cache.update_target_data(txn, &updated)?;
                state.targets.insert(change.target_id, updated);
            }
            Ok(())
        })
    }

    /// Assigns a target id to `target`, reusing persisted data when the
    /// target was listened to before.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.run("Allocate target", TransactionMode::ReadWrite, |state, txn| {
            if let Some(existing) = state.target_cache.get_target_data(txn, &target)? {
                return Ok(existing);
            }
            let target_id = state.target_cache.allocate_target_id(txn)?;
            let sequence_number = state.target_cache.next_sequence_number(txn)?;
            let target_data =
                TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
            state.target_cache.add_target_data(txn, &target_data)?;
            Ok(target_data)
        })?;

        let mut state = self.lock_state()?;
        let target_id = target_data.target_id;
        state
            .target_ids_by_canonical_id
            .insert(target_data.target.canonical_id(), target_id);
        let active = state
            .targets
            .entry(target_id)
            .or_insert_with(|| target_data.clone());
        Ok(active.clone())
    }

    /// Active or persisted target data for `target`.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        self.run("Get target data", TransactionMode::ReadOnly, |state, txn| {
            if let Some(target_id) = state.target_ids_by_canonical_id.get(&target.canonical_id()) {
                return Ok(state.targets.get(target_id).cloned());
            }
            state.target_cache.get_target_data(txn, target)
        })
    }

    /// Stops tracking a target. With eager garbage collection the target
    /// data is deleted and documents nobody references leave the cache.
    pub fn release_target(&self, target_id: i32) -> FirestoreResult<()> {
        let eager_gc = self.eager_gc;
        self.run("Release target", TransactionMode::ReadWrite, |state, txn| {
            let Some(target_data) = state.targets.get(&target_id).cloned() else {
                log::debug!("ignoring release of inactive target {target_id}");
                return Ok(());
            };
            state.local_view_references.remove_references_for_id(target_id);

            if eager_gc {
                let candidates = state
                    .target_cache
                    .get_matching_keys_for_target_id(txn, target_id)?;
                state.target_cache.remove_target_data(txn, &target_data)?;
                collect_garbage(state, txn, &candidates)?;
            } else {
                let sequence_number = state.target_cache.next_sequence_number(txn)?;
                state
                    .target_cache
                    .update_target_data(txn, &target_data.with_sequence_number(sequence_number))?;
            }

            state.targets.remove(&target_id);
            state
                .target_ids_by_canonical_id
                .retain(|_, id| *id != target_id);
            Ok(())
        })
    }

    /// Runs `query` against the cache. With `use_previous_results` the
    /// previous result set of its target seeds the execution.
    pub fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let query_engine = &self.query_engine;
        self.run("Execute query", TransactionMode::ReadWrite, |state, txn| {
            let target = query.to_target();
            let target_data = match state.target_ids_by_canonical_id.get(&target.canonical_id()) {
                Some(target_id) => state.targets.get(target_id).cloned(),
                None => state.target_cache.get_target_data(txn, &target)?,
            };
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    state
                        .target_cache
                        .get_matching_keys_for_target_id(txn, target_data.target_id)?,
                ),
                None => (SnapshotVersion::min(), DocumentKeySet::new()),
            };
            let (documents, strategy) = if use_previous_results {
                query_engine.get_documents_matching_query(
                    txn,
                    &mut state.documents,
                    query,
                    last_limbo_free,
                    &remote_keys,
                )?
            } else {
                query_engine.get_documents_matching_query(
                    txn,
                    &mut state.documents,
                    query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?
            };
            log::debug!(
                "query {} returned {} documents ({strategy:?})",
                query.canonical_id(),
                documents.len()
            );
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    /// Local view of one document; invalid when nothing is known about it.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        self.run("Read document", TransactionMode::ReadOnly, |state, txn| {
            state.documents.get_document(txn, key)
        })
    }

    pub fn get_remote_document_keys(&self, target_id: i32) -> FirestoreResult<DocumentKeySet> {
        self.run("Remote document keys", TransactionMode::ReadOnly, |state, txn| {
            state.target_cache.get_matching_keys_for_target_id(txn, target_id)
        })
    }

    /// Target data of an active target.
    pub fn active_target_data(&self, target_id: i32) -> FirestoreResult<Option<TargetData>> {
        Ok(self.lock_state()?.targets.get(&target_id).cloned())
    }
}

fn should_persist_target_data(
    old: &TargetData,
    new: &TargetData,
    change: &crate::firestore::remote::TargetChange,
) -> bool {
    if old.resume_token.is_empty() || new.resume_token.is_empty() {
        return true;
    }
    let old_micros = micros(old.snapshot_version.timestamp());
    let new_micros = micros(new.snapshot_version.timestamp());
    if new_micros - old_micros >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len()
        > 0
}

fn micros(timestamp: Timestamp) -> i64 {
    timestamp.seconds * 1_000_000 + i64::from(timestamp.nanos) / 1_000
}

/// Drops cached documents that no target, view or pending write references.
fn collect_garbage(
    state: &mut LocalStoreState,
    txn: &mut dyn PersistenceTransaction,
    candidates: &DocumentKeySet,
) -> FirestoreResult<()> {
    let mut removed = 0usize;
    for key in candidates {
        if state.target_cache.contains_key(txn, key)?
            || state.local_view_references.contains_key(key)
            || !state
                .documents
                .mutation_queue()
                .all_mutation_batches_affecting_key(txn, key)?
                .is_empty()
        {
            continue;
        }
        state.documents.remote_documents().remove_entry(txn, key)?;
        removed += 1;
    }
    if removed > 0 {
        log::debug!("garbage collected {removed} documents");
    }
    Ok(())
}
