use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Metadata,
}

impl ChangeType {
    /// Removals are reported first, then additions, then modifications.
    pub(crate) fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Accumulates per-key changes, folding successive changes to one document
/// into the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        let merged = match (old.change_type, change.change_type) {
            (ChangeType::Removed, ChangeType::Added) => Some(DocumentViewChange {
                change_type: ChangeType::Modified,
                document: change.document,
            }),
            (old_type, ChangeType::Metadata) if old_type != ChangeType::Removed => {
                Some(DocumentViewChange {
                    change_type: old_type,
                    document: change.document,
                })
            }
            (ChangeType::Modified, ChangeType::Modified) => Some(change),
            (ChangeType::Added, ChangeType::Modified) => Some(DocumentViewChange {
                change_type: ChangeType::Added,
                document: change.document,
            }),
            (ChangeType::Added, ChangeType::Removed) => None,
            (ChangeType::Modified, ChangeType::Removed)
            | (ChangeType::Metadata, ChangeType::Removed) => Some(DocumentViewChange {
                change_type: ChangeType::Removed,
                document: old.document.clone(),
            }),
            (ChangeType::Metadata, ChangeType::Added) => Some(DocumentViewChange {
                change_type: ChangeType::Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                log::debug!(
                    "unexpected change sequence {old_type:?} -> {new_type:?} for {key}, keeping latest"
                );
                Some(change)
            }
        };

        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// What a listener sees: the ordered result set plus the changes since the
/// previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot in which every document is reported as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(docs.comparator().clone());
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};

    fn doc(path: &str, version: i64) -> Document {
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(crate::firestore::model::Timestamp::new(version, 0)),
            ObjectValue::empty(),
        )
    }

    fn change(change_type: ChangeType, document: Document) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document,
        }
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("a/1", 1)));
        set.track(change(ChangeType::Removed, doc("a/1", 1)));
        assert!(set.is_empty());
    }

    #[test]
    fn removed_then_added_is_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, doc("a/1", 1)));
        set.track(change(ChangeType::Added, doc("a/1", 2)));
        let changes = set.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(changes[0].document.version(), doc("a/1", 2).version());
    }

    #[test]
    fn added_then_modified_stays_added() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("a/1", 1)));
        set.track(change(ChangeType::Modified, doc("a/1", 2)));
        set.track(change(ChangeType::Metadata, doc("a/1", 3)));
        let changes = set.changes();
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].document.version(), doc("a/1", 3).version());
    }

    #[test]
    fn modified_then_removed_reports_old_document() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Modified, doc("a/1", 1)));
        set.track(change(ChangeType::Removed, doc("a/1", 2)));
        let changes = set.changes();
        assert_eq!(changes[0].change_type, ChangeType::Removed);
        assert_eq!(changes[0].document.version(), doc("a/1", 1).version());
    }
}
