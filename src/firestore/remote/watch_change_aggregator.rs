use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet;

    /// Target data for targets that are still being listened to.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// Outcome of reconciling an existence filter with its bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

struct TargetState {
    /// Outstanding add/remove requests; changes for a pending target are dropped.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = (self.pending_responses - 1).max(0);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the server marks a consistent snapshot,
/// then turns them into a single [`RemoteEvent`].
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    bloom_filter_enabled: bool,
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer, bloom_filter_enabled: bool) -> Self {
        Self {
            serializer,
            bloom_filter_enabled,
            target_states: BTreeMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentWatchChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let found = change
            .new_doc
            .as_ref()
            .filter(|document| document.is_found_document());
        for target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(*target_id, document.clone(), provider),
                None => self.remove_document_from_target(
                    *target_id,
                    change.key.clone(),
                    change.new_doc.clone(),
                    provider,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                change.key.clone(),
                change.new_doc.clone(),
                provider,
            );
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.affected_targets(change, provider) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, provider) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A newly added target has no changes yet; drop what
                        // may have arrived before the add was acknowledged.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, provider) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, provider) {
                        self.reset_target(target_id, provider);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(
        &self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> Vec<i32> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, provider))
            .collect()
    }

    /// Compares the server's document count with ours and schedules a
    /// re-query when they disagree and the bloom filter cannot explain it.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted; synthesize the deletion since
                // the server will not send one for a document target.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, key, Some(deleted), provider);
                }
            } else if expected_count != 1 {
                log::warn!(
                    "Single document existence filter for target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, provider);
        if current_count == expected_count {
            return;
        }

        let status = match self.parse_bloom_filter(change) {
            Some(bloom_filter) => {
                let removed = self.filter_removed_documents(&bloom_filter, target_id, provider);
                if expected_count == current_count - removed {
                    BloomFilterApplication::Success
                } else {
                    BloomFilterApplication::FalsePositive
                }
            }
            None => BloomFilterApplication::Skipped,
        };

        if status != BloomFilterApplication::Success {
            log::debug!(
                "Existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count} (bloom filter {status:?})"
            );
            self.reset_target(target_id, provider);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        if !self.bloom_filter_enabled {
            return None;
        }
        let payload = change.unchanged_names.as_ref()?;
        match BloomFilter::from_payload(payload) {
            Ok(filter) if filter.bit_count() > 0 => Some(filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("Ignoring malformed bloom filter for target {}: {err}", change.target_id);
                None
            }
        }
    }

    /// Removes every known key the bloom filter rules out and returns how many were removed.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: i32,
        provider: &dyn TargetMetadataProvider,
    ) -> i32 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&self.serializer.document_name(&key)) {
                self.remove_document_from_target(target_id, key, None, provider);
                removed += 1;
            }
        }
        removed
    }

    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map(|targets| targets.contains(&target_id))
                        .unwrap_or(false);
                    if !updated && !self.target_contains_document(target_id, &key, provider) {
                        // A current document target that never received its
                        // document means the document does not exist.
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, key, Some(deleted), provider);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, provider)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        target_id: i32,
        document: Document,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, provider) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated` is the document's new state when known (a deletion), or
    /// `None` when the document merely left the target.
    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: DocumentKey,
        updated: Option<Document>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // The document was added and removed again within this snapshot.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated {
            self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: i32,
        provider: &dyn TargetMetadataProvider,
    ) -> i32 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i32
            + change.added_documents.len() as i32
            - change.removed_documents.len() as i32
    }

    /// Called whenever a watch or unwatch request is sent for the target;
    /// changes are ignored until every request has been answered.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: i32, provider: &dyn TargetMetadataProvider) -> bool {
        let active = self
            .target_data_for_active_target(target_id, provider)
            .is_some();
        if !active {
            log::debug!("Detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        target_id: i32,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    /// Forgets everything received for the target and queues the removal
    /// of every key the local store associates with it.
    fn reset_target(&mut self, target_id: i32, provider: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, provider);
        }
    }

    fn target_contains_document(
        &self,
        target_id: i32,
        key: &DocumentKey,
        provider: &dyn TargetMetadataProvider,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}
