use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{PersistenceTransaction, Table};
use crate::firestore::model::ResourcePath;

/// Records which parent paths contain a collection with a given id, so
/// collection group queries know where to look.
#[derive(Clone, Debug, Default)]
pub struct CollectionParentIndex;

impl CollectionParentIndex {
    fn row_key(collection_id: &str, parent: &ResourcePath) -> String {
        format!("{collection_id}/{}", parent.canonical_string())
    }

    /// Indexes the collection at `collection_path` (odd length path).
    pub fn add_to_index(
        &self,
        txn: &mut dyn PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let key = Self::row_key(collection_id, &collection_path.without_last());
        if txn.get(Table::CollectionParents, &key)?.is_none() {
            txn.put(Table::CollectionParents, &key, Vec::new())?;
        }
        Ok(())
    }

    pub fn get_collection_parents(
        &self,
        txn: &dyn PersistenceTransaction,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let prefix = format!("{collection_id}/");
        txn.scan_prefix(Table::CollectionParents, &prefix)?
            .into_iter()
            .map(|(key, _)| ResourcePath::from_string(&key[prefix.len()..]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};

    #[test]
    fn lists_parents_by_collection_id() {
        let persistence = MemoryPersistence::new();
        let index = CollectionParentIndex;
        let parents = run_transaction(&persistence, "index", TransactionMode::ReadWrite, |txn| {
            index.add_to_index(txn, &ResourcePath::from_string("rooms").unwrap())?;
            index.add_to_index(txn, &ResourcePath::from_string("rooms/a/messages").unwrap())?;
            index.add_to_index(txn, &ResourcePath::from_string("rooms/b/messages").unwrap())?;
            index.add_to_index(txn, &ResourcePath::from_string("rooms/b/messages").unwrap())?;
            index.add_to_index(txn, &ResourcePath::from_string("messagesx").unwrap())?;
            index.get_collection_parents(txn, "messages")
        })
        .unwrap();
        let parents: Vec<String> = parents.iter().map(|p| p.canonical_string()).collect();
        assert_eq!(parents, vec!["rooms/a", "rooms/b"]);
    }
}
