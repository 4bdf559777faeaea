use std::collections::BTreeSet;
use std::sync::Mutex as StdMutex;

use crate::firestore::core::{Filter, FilterOperator, Query};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::collection_parent_index::CollectionParentIndex;
use crate::firestore::local::persistence::{PersistenceTransaction, Table};
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, ResourcePath};
use crate::firestore::settings::FieldIndexSettings;
use crate::firestore::value::{canonical_id, FirestoreValue};

/// Single-field equality indexes over the remote document cache.
///
/// Entries are keyed `group|field|value|path`. The canonical value form can
/// collide across types, so callers always re-check matches against the query.
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: StdMutex<BTreeSet<FieldIndexSettings>>,
}

/// An index lookup that can serve a query.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexPlan {
    pub index: FieldIndexSettings,
    pub value: FirestoreValue,
}

impl IndexManager {
    pub fn new(indexes: impl IntoIterator<Item = FieldIndexSettings>) -> Self {
        Self {
            indexes: StdMutex::new(indexes.into_iter().collect()),
        }
    }

    fn configured(&self) -> FirestoreResult<BTreeSet<FieldIndexSettings>> {
        self.indexes
            .lock()
            .map(|indexes| indexes.clone())
            .map_err(|_| internal_error("index configuration lock poisoned"))
    }

    pub fn field_indexes(&self) -> FirestoreResult<Vec<FieldIndexSettings>> {
        Ok(self.configured()?.into_iter().collect())
    }

    fn entry_prefix(index: &FieldIndexSettings, value: &FirestoreValue) -> String {
        format!(
            "{}|{}|{}|",
            index.collection_group,
            index.field.canonical_string(),
            canonical_id(value)
        )
    }

    fn entry_keys(indexes: &BTreeSet<FieldIndexSettings>, document: &Document) -> Vec<String> {
        if !document.is_found_document() {
            return Vec::new();
        }
        indexes
            .iter()
            .filter(|index| document.key().has_collection_id(&index.collection_group))
            .filter_map(|index| {
                document.field(&index.field).map(|value| {
                    format!(
                        "{}{}",
                        Self::entry_prefix(index, value),
                        document.key().path().canonical_string()
                    )
                })
            })
            .collect()
    }

    /// Replaces the entries of `previous` with those of `document`.
    pub fn update_index_entries(
        &self,
        txn: &mut dyn PersistenceTransaction,
        previous: Option<&Document>,
        document: &Document,
    ) -> FirestoreResult<()> {
        let indexes = self.configured()?;
        if indexes.is_empty() {
            return Ok(());
        }
        let old_keys = previous
            .map(|previous| Self::entry_keys(&indexes, previous))
            .unwrap_or_default();
        let new_keys = Self::entry_keys(&indexes, document);
        for key in old_keys.iter().filter(|key| !new_keys.contains(key)) {
            txn.delete(Table::IndexEntries, key)?;
        }
        for key in new_keys.iter().filter(|key| !old_keys.contains(key)) {
            txn.put(Table::IndexEntries, key, Vec::new())?;
        }
        Ok(())
    }

    /// Registers an index and back-fills it from the cached documents.
    /// Returns false if the index already existed.
    pub fn add_field_index(
        &self,
        txn: &mut dyn PersistenceTransaction,
        collection_parents: &CollectionParentIndex,
        index: FieldIndexSettings,
    ) -> FirestoreResult<bool> {
        {
            let mut indexes = self
                .indexes
                .lock()
                .map_err(|_| internal_error("index configuration lock poisoned"))?;
            if !indexes.insert(index.clone()) {
                return Ok(false);
            }
        }
        self.backfill(txn, collection_parents, &index)?;
        Ok(true)
    }

    /// Writes entries for every cached document in the index's collection group.
    pub fn backfill(
        &self,
        txn: &mut dyn PersistenceTransaction,
        collection_parents: &CollectionParentIndex,
        index: &FieldIndexSettings,
    ) -> FirestoreResult<()> {
        let single: BTreeSet<FieldIndexSettings> = [index.clone()].into_iter().collect();
        for parent in collection_parents.get_collection_parents(txn, &index.collection_group)? {
            let collection = parent.child([index.collection_group.as_str()]);
            let prefix = format!("{}/", collection.canonical_string());
            let rows = txn.scan_prefix(Table::RemoteDocuments, &prefix)?;
            for (path, bytes) in rows {
                let path = ResourcePath::from_string(&path)?;
                if !collection.is_immediate_parent_of(&path) {
                    continue;
                }
                let document: Document = serde_json::from_slice(&bytes).map_err(|err| {
                    crate::firestore::error::data_loss(format!("corrupt document {path}: {err}"))
                })?;
                for key in Self::entry_keys(&single, &document) {
                    txn.put(Table::IndexEntries, &key, Vec::new())?;
                }
            }
        }
        log::debug!(
            "back-filled index on {}.{}",
            index.collection_group,
            index.field
        );
        Ok(())
    }

    /// Picks an index that can answer one of the query's top-level equality filters.
    pub fn plan(&self, query: &Query) -> FirestoreResult<Option<IndexPlan>> {
        if query.is_document_query() {
            return Ok(None);
        }
        let Some(group) = collection_id_of(query) else {
            return Ok(None);
        };
        let indexes = self.configured()?;
        let plan = query.filters().iter().find_map(|filter| match filter {
            Filter::Field(filter)
                if filter.op() == FilterOperator::Equal && !filter.field().is_key_field() =>
            {
                let index = FieldIndexSettings::new(group.clone(), filter.field().clone());
                indexes.contains(&index).then(|| IndexPlan {
                    index,
                    value: filter.value().clone(),
                })
            }
            _ => None,
        });
        Ok(plan)
    }

    /// A candidate index for a query that had to fall back to a full scan.
    pub fn candidate_index(query: &Query) -> Option<FieldIndexSettings> {
        let group = collection_id_of(query)?;
        query.filters().iter().find_map(|filter| match filter {
            Filter::Field(filter)
                if filter.op() == FilterOperator::Equal && !filter.field().is_key_field() =>
            {
                Some(FieldIndexSettings::new(group.clone(), filter.field().clone()))
            }
            _ => None,
        })
    }

    /// Keys of documents whose indexed field equals the plan's value and that
    /// live where the query looks.
    pub fn documents_matching(
        &self,
        txn: &dyn PersistenceTransaction,
        plan: &IndexPlan,
        query: &Query,
    ) -> FirestoreResult<DocumentKeySet> {
        let prefix = Self::entry_prefix(&plan.index, &plan.value);
        let mut keys = DocumentKeySet::new();
        for (entry, _) in txn.scan_prefix(Table::IndexEntries, &prefix)? {
            let key = DocumentKey::from_string(&entry[prefix.len()..])?;
            let in_scope = if query.is_collection_group_query() {
                query.path().is_prefix_of(key.path())
            } else {
                query.path().is_immediate_parent_of(key.path())
            };
            if in_scope {
                keys.insert(key);
            }
        }
        Ok(keys)
    }
}

fn collection_id_of(query: &Query) -> Option<String> {
    match query.collection_group_id() {
        Some(group) => Some(group.to_string()),
        None => query.path().last_segment().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};
    use crate::firestore::model::{FieldPath, ObjectValue, SnapshotVersion};

    fn room(path: &str, city: &str) -> Document {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("city").unwrap(), city.into());
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn city_index() -> FieldIndexSettings {
        FieldIndexSettings::new("rooms", FieldPath::from_dot_separated("city").unwrap())
    }

    #[test]
    fn plans_equality_filters_on_indexed_fields() {
        let manager = IndexManager::new([city_index()]);
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .where_field("city", FilterOperator::Equal, "sf")
            .unwrap();
        let plan = manager.plan(&query).unwrap().unwrap();
        assert_eq!(plan.index, city_index());

        let range = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .where_field("city", FilterOperator::GreaterThan, "sf")
            .unwrap();
        assert!(manager.plan(&range).unwrap().is_none());
    }

    #[test]
    fn entries_follow_document_updates() {
        let persistence = MemoryPersistence::new();
        let manager = IndexManager::new([city_index()]);
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .where_field("city", FilterOperator::Equal, "sf")
            .unwrap();

        let keys = run_transaction(&persistence, "index", TransactionMode::ReadWrite, |txn| {
            manager.update_index_entries(txn, None, &room("rooms/a", "sf"))?;
            manager.update_index_entries(txn, None, &room("rooms/b", "sf"))?;
            manager.update_index_entries(
                txn,
                Some(&room("rooms/b", "sf")),
                &room("rooms/b", "la"),
            )?;
            let plan = manager.plan(&query)?.unwrap();
            manager.documents_matching(txn, &plan, &query)
        })
        .unwrap();
        let ids: Vec<&str> = keys.iter().map(|k| k.id()).collect();
        assert_eq!(ids, vec!["a"]);
    }
}
