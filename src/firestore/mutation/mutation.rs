use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldPath, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::mutation::{FieldTransform, TransformOperation};
use crate::firestore::value::FirestoreValue;

/// Condition the document must satisfy for a mutation to apply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Outcome the backend reported for one mutation of a committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Version of the document after the write, or the commit time.
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

/// A single write to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes only the fields named by `field_mask`; masked fields absent
    /// from `data` are deleted.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Applies field transforms to an existing document.
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    /// Checks a precondition without writing.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patches `field_mask`, requiring the document to exist.
    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform {
            key,
            field_transforms,
            precondition: Precondition::Exists(true),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Transform { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn with_field_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            }
            | Mutation::Transform {
                field_transforms, ..
            } => *field_transforms = transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Transform { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            }
            | Mutation::Transform {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields written by a patch; `None` for mutations that replace the document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask),
            _ => None,
        }
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` holds the fields touched so far (`None` means the
    /// whole document was overwritten); the updated mask is returned.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(field_transforms, local_write_time, document);
                let mut new_data = value.clone();
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(field_transforms, local_write_time, document);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, field_mask));
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields().cloned())
                        .union_with(transform_paths(field_transforms))
                })
            }
            Mutation::Transform {
                field_transforms, ..
            } => {
                let transform_results =
                    local_transform_results(field_transforms, local_write_time, document);
                let mut new_data = document.data().clone();
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| mask.union_with(transform_paths(field_transforms)))
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    server_transform_results(document, field_transforms, &result.transform_results);
                let mut new_data = value.clone();
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The server applied it, so the document exists; its contents are unknown.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(document, field_transforms, &result.transform_results);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, field_mask));
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Transform {
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(document, field_transforms, &result.transform_results);
                let mut new_data = document.data().clone();
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Captures the values increments start from so that recomputing the
    /// overlay later does not depend on a changed base document.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        let mut found = false;
        for transform in self.field_transforms() {
            if let TransformOperation::NumericIncrement(_) = transform.operation() {
                let existing = document.field(transform.field_path());
                base.set(
                    transform.field_path(),
                    transform.compute_base_value(existing),
                );
                found = true;
            }
        }
        found.then_some(base)
    }
}

fn patch_entries(
    data: &ObjectValue,
    field_mask: &FieldMask,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    field_mask
        .fields()
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

fn transform_paths(transforms: &[FieldTransform]) -> Vec<FieldPath> {
    transforms
        .iter()
        .map(|transform| transform.field_path().clone())
        .collect()
}

fn local_transform_results(
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
    document: &Document,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(transform.field_path());
            (
                transform.field_path().clone(),
                Some(transform.apply_to_local_view(previous, local_write_time)),
            )
        })
        .collect()
}

fn server_transform_results(
    document: &Document,
    transforms: &[FieldTransform],
    server_results: &[FirestoreValue],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    if !server_results.is_empty() && server_results.len() != transforms.len() {
        log::warn!(
            "server returned {} transform results for {} transforms",
            server_results.len(),
            transforms.len()
        );
    }
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(transform.field_path());
            (
                transform.field_path().clone(),
                Some(transform.apply_to_remote_document(previous, server_results.get(index).cloned())),
            )
        })
        .collect()
}

/// The single mutation that turns the remote version of `document` into
/// its current local view.
///
/// `mask` is the set of fields touched by pending patches, or `None` when
/// a pending set or delete replaced the whole document.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };

    if mask.is_empty() {
        return None;
    }

    let mut patch_value = ObjectValue::empty();
    let mut mask_paths = Vec::new();
    for path in mask.fields() {
        if mask_paths.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = document.field(&path);
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        mask_paths.push(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, FieldMask::new(mask_paths))
            .with_precondition(Precondition::None),
    )
}
