use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, FieldMask, SnapshotVersion, Timestamp,
};
use crate::firestore::mutation::{calculate_overlay_mutation, Mutation, MutationResult};

/// Batch id used before any batch has been acknowledged.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A group of mutations written atomically by one call to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Patches capturing transform base values, applied before `mutations`.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

/// A document's local view together with the fields its overlay touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    /// `None` when a pending set or delete covers the whole document.
    pub mutated_fields: Option<FieldMask>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the batch's mutations for `document`'s key to its local view.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        let key = document.key().clone();
        for mutation in self
            .base_mutations
            .iter()
            .chain(self.mutations.iter())
            .filter(|mutation| mutation.key() == &key)
        {
            mutated_fields =
                mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
        }
        mutated_fields
    }

    /// Applies the batch to every document in `documents` and returns the
    /// overlay mutation for each key that changed.
    ///
    /// Keys in `documents_without_remote_version` get a full overlay since
    /// there is no cached base to patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mut mutated_fields =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.clone());
            if documents_without_remote_version.contains(&key) {
                mutated_fields = None;
            }
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    /// Applies the acknowledged batch to the cached remote `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            if let Some(mutation_result) = result.mutation_results.get(index) {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }
}

/// The server's acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

/// The net pending mutation for one document, tagged with the newest
/// batch that contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ObjectValue};
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn object(field: &str, value: i64) -> ObjectValue {
        let mut object = ObjectValue::empty();
        object.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        object
    }

    #[test]
    fn result_requires_one_result_per_mutation() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("a/1"), object("x", 1))],
        );
        assert!(MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new())
            .is_err());
    }

    #[test]
    fn local_view_only_applies_mutations_for_the_document() {
        let batch = MutationBatch::new(
            2,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("a/1"), object("x", 1)),
                Mutation::set(key("a/2"), object("x", 2)),
            ],
        );
        let mut document = Document::new_invalid_document(key("a/1"));
        let mutated = batch.apply_to_local_view(&mut document, Some(FieldMask::empty()));
        assert!(mutated.is_none());
        assert_eq!(
            document.field(&FieldPath::from_dot_separated("x").unwrap()),
            Some(&FirestoreValue::from_integer(1))
        );
    }

    #[test]
    fn local_document_set_produces_set_overlay_for_new_documents() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("a/1"), object("x", 1))],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("a/1"),
            OverlayedDocument {
                document: Document::new_invalid_document(key("a/1")),
                mutated_fields: Some(FieldMask::empty()),
            },
        );
        let missing: DocumentKeySet = [key("a/1")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &missing);
        assert!(matches!(overlays.get(&key("a/1")), Some(Mutation::Set { .. })));
        assert!(documents[&key("a/1")].document.is_found_document());
    }
}
