use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::collection_parent_index::CollectionParentIndex;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::{
    get_json, put_json, scan_json, PersistenceTransaction, Table,
};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, DocumentMap, ResourcePath, SnapshotVersion,
};

/// How much of a collection to read from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteScan {
    /// Every cached document under the query path.
    Full,
    /// Only documents read after the given version.
    ChangedSince(SnapshotVersion),
    /// No cached documents; only overlays contribute.
    Skip,
}

/// Counts the documents a query execution touched.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryContext {
    pub documents_read: usize,
}

/// Cache of the latest document state the backend has confirmed.
#[derive(Clone, Debug)]
pub struct RemoteDocumentCache {
    index_manager: Arc<IndexManager>,
    collection_parents: CollectionParentIndex,
}

fn row_key(key: &DocumentKey) -> String {
    key.path().canonical_string()
}

impl RemoteDocumentCache {
    pub fn new(index_manager: Arc<IndexManager>) -> Self {
        Self {
            index_manager,
            collection_parents: CollectionParentIndex,
        }
    }

    /// Stores `document` with `read_time` and keeps secondary indexes current.
    pub fn add_entry(
        &self,
        txn: &mut dyn PersistenceTransaction,
        document: &Document,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let key = row_key(document.key());
        let previous: Option<Document> = get_json(txn, Table::RemoteDocuments, &key)?;
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        put_json(txn, Table::RemoteDocuments, &key, &stored)?;
        self.collection_parents
            .add_to_index(txn, &document.key().collection_path())?;
        self.index_manager
            .update_index_entries(txn, previous.as_ref(), &stored)
    }

    pub fn remove_entry(
        &self,
        txn: &mut dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        let row = row_key(key);
        if let Some(previous) = get_json::<Document>(txn, Table::RemoteDocuments, &row)? {
            let tombstone = Document::new_invalid_document(key.clone());
            self.index_manager
                .update_index_entries(txn, Some(&previous), &tombstone)?;
        }
        txn.delete(Table::RemoteDocuments, &row)
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(
        &self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Document> {
        Ok(get_json(txn, Table::RemoteDocuments, &row_key(key))?
            .unwrap_or_else(|| Document::new_invalid_document(key.clone())))
    }

    pub fn get_entries<'a>(
        &self,
        txn: &dyn PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        keys.into_iter()
            .map(|key| Ok((key.clone(), self.get_entry(txn, key)?)))
            .collect()
    }

    /// Cached documents directly inside `collection` that match `query` or
    /// have an overlay in `overlay_keys`.
    pub fn get_documents_matching_query(
        &self,
        txn: &dyn PersistenceTransaction,
        collection: &ResourcePath,
        query: &Query,
        scan: RemoteScan,
        overlay_keys: &DocumentKeySet,
        context: &mut QueryContext,
    ) -> FirestoreResult<DocumentMap> {
        let since = match scan {
            RemoteScan::Skip => return Ok(DocumentMap::new()),
            RemoteScan::Full => None,
            RemoteScan::ChangedSince(version) => Some(version),
        };
        let prefix = format!("{}/", collection.canonical_string());
        let mut results = DocumentMap::new();
        for (_, document) in scan_json::<Document>(txn, Table::RemoteDocuments, &prefix)? {
            if !collection.is_immediate_parent_of(document.key().path()) {
                continue;
            }
            context.documents_read += 1;
            if since.is_some_and(|since| document.read_time() <= since) {
                continue;
            }
            if query.matches(&document) || overlay_keys.contains(document.key()) {
                results.insert(document.key().clone(), document);
            }
        }
        Ok(results)
    }

    pub fn collection_parents(&self) -> &CollectionParentIndex {
        &self.collection_parents
    }

    pub fn index_manager(&self) -> &Arc<IndexManager> {
        &self.index_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::FilterOperator;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};
    use crate::firestore::model::{FieldPath, ObjectValue, Timestamp};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, likes: i64) -> Document {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("likes").unwrap(), likes.into());
        Document::new_found_document(DocumentKey::from_string(path).unwrap(), version(1), data)
    }

    fn cache() -> RemoteDocumentCache {
        RemoteDocumentCache::new(Arc::new(IndexManager::default()))
    }

    #[test]
    fn missing_entries_are_invalid() {
        let persistence = MemoryPersistence::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let doc = run_transaction(&persistence, "read", TransactionMode::ReadOnly, |txn| {
            cache().get_entry(txn, &key)
        })
        .unwrap();
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn scans_only_immediate_children() {
        let persistence = MemoryPersistence::new();
        let cache = cache();
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let query = Query::collection(rooms.clone())
            .where_field("likes", FilterOperator::GreaterThan, 10)
            .unwrap();
        let (docs, read) = run_transaction(&persistence, "scan", TransactionMode::ReadWrite, |txn| {
            cache.add_entry(txn, &doc("rooms/a", 20), version(1))?;
            cache.add_entry(txn, &doc("rooms/b", 5), version(1))?;
            cache.add_entry(txn, &doc("rooms/a/messages/m", 50), version(1))?;
            cache.add_entry(txn, &doc("roomsx/c", 50), version(1))?;
            let mut context = QueryContext::default();
            let docs = cache.get_documents_matching_query(
                txn,
                &rooms,
                &query,
                RemoteScan::Full,
                &DocumentKeySet::new(),
                &mut context,
            )?;
            Ok((docs, context.documents_read))
        })
        .unwrap();
        let ids: Vec<&str> = docs.keys().map(|k| k.id()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(read, 2);
    }

    #[test]
    fn changed_since_filters_by_read_time() {
        let persistence = MemoryPersistence::new();
        let cache = cache();
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let query = Query::collection(rooms.clone());
        let docs = run_transaction(&persistence, "scan", TransactionMode::ReadWrite, |txn| {
            cache.add_entry(txn, &doc("rooms/old", 1), version(1))?;
            cache.add_entry(txn, &doc("rooms/new", 1), version(5))?;
            cache.get_documents_matching_query(
                txn,
                &rooms,
                &query,
                RemoteScan::ChangedSince(version(3)),
                &DocumentKeySet::new(),
                &mut QueryContext::default(),
            )
        })
        .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs.contains_key(&DocumentKey::from_string("rooms/new").unwrap()));
    }
}
