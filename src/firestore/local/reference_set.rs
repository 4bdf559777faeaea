use std::collections::BTreeSet;

use crate::firestore::model::{DocumentKey, DocumentKeySet};

/// Two-way index of (document key, id) references.
///
/// Lets callers ask both "is this key referenced at all" and "which keys
/// does this id reference".
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id
            .iter()
            .filter(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }

    /// Ids that reference `key`.
    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .map(|(_, id)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("rooms/a"), 1);
        refs.add_reference(key("rooms/a"), 2);
        refs.add_reference(key("rooms/b"), 2);

        assert_eq!(refs.ids_for_key(&key("rooms/a")), vec![1, 2]);
        let removed = refs.remove_references_for_id(2);
        assert_eq!(removed.len(), 2);
        assert!(refs.contains_key(&key("rooms/a")));
        assert!(!refs.contains_key(&key("rooms/b")));

        refs.remove_reference(&key("rooms/a"), 1);
        assert!(refs.is_empty());
    }
}
