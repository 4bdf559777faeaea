use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents kept in the order defined by a query, with lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// A set ordered by document key only.
    pub fn by_key_order() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| {
            left.key().cmp(right.key())
        }))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, document: Document) {
        self.delete(&document.key().clone());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        match self.position(&existing) {
            Ok(index) => {
                self.sorted.remove(index);
            }
            Err(_) => self.sorted.retain(|document| document.key() != key),
        }
        Some(existing)
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        let comparator = &self.comparator;
        self.sorted
            .binary_search_by(|candidate| comparator(candidate, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ObjectValue, SnapshotVersion};
    use crate::firestore::value::{compare_values, FirestoreValue};

    fn doc(id: &str, rank: i64) -> Document {
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        Document::new_found_document(
            DocumentKey::from_string(&format!("items/{id}")).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn by_rank() -> DocumentComparator {
        let field = FieldPath::from_dot_separated("rank").unwrap();
        Arc::new(move |l: &Document, r: &Document| {
            let null = FirestoreValue::null();
            compare_values(l.field(&field).unwrap_or(&null), r.field(&field).unwrap_or(&null))
                .then_with(|| l.key().cmp(r.key()))
        })
    }

    #[test]
    fn keeps_comparator_order_on_replace() {
        let mut set = DocumentSet::new(by_rank());
        set.add(doc("a", 3));
        set.add(doc("b", 1));
        set.add(doc("c", 2));
        let ids: Vec<&str> = set.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        set.add(doc("b", 10));
        let ids: Vec<&str> = set.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&DocumentKey::from_string("items/a").unwrap()), Some(1));
    }

    #[test]
    fn delete_removes_from_both_views() {
        let mut set = DocumentSet::by_key_order();
        set.add(doc("a", 1));
        set.add(doc("b", 2));
        let key = DocumentKey::from_string("items/a").unwrap();
        assert!(set.delete(&key).is_some());
        assert!(!set.contains(&key));
        assert_eq!(set.first().unwrap().key().id(), "b");
    }
}
