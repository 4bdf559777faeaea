use std::collections::BTreeMap;

use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion};

/// Everything the watch stream delivered up to one consistent snapshot version.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose existence filter did not match and that must be re-queried.
    pub target_mismatches: BTreeMap<i32, TargetPurpose>,
    /// Latest known state of each changed document, including deletions.
    pub document_updates: DocumentMap,
    /// Documents that belong to no target other than a limbo resolution.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// An event that only resets the synced state of one target, used when a
    /// listen is rejected or a limbo target turns out to be empty.
    pub fn for_target(
        snapshot_version: SnapshotVersion,
        target_id: i32,
        change: TargetChange,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, change);
        Self {
            snapshot_version,
            target_changes,
            ..Self::default()
        }
    }
}

/// Per-target membership delta within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// The change applied to a target that must be re-synced from scratch.
    pub fn reset(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.added_documents.contains(key)
            || self.modified_documents.contains(key)
            || self.removed_documents.contains(key)
    }
}
