use std::collections::{BTreeMap, HashSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, ObjectValue};
use crate::firestore::mutation::{FieldTransform, Mutation, Precondition, TransformOperation};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Options that configure how a `set` write treats existing fields.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merge the provided fields into the existing document instead of
    /// replacing it.
    pub merge: bool,
    /// Only merge these fields. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for field in fields {
            if seen.insert(field.canonical_string()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument(
                "merge_fields requires at least one field path",
            ));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

/// Where a value is being parsed; decides which sentinels are legal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Set,
    MergeSet,
    Update,
}

#[derive(Default)]
struct ParseContext {
    transforms: Vec<FieldTransform>,
    deleted_fields: Vec<FieldPath>,
}

/// Turns user data for a `set` into a mutation. Sentinels become field
/// transforms; merges become patches without a precondition.
pub fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let mode = if options.is_merge() {
        ParseMode::MergeSet
    } else {
        ParseMode::Set
    };
    let mut context = ParseContext::default();
    let cleaned = parse_map(&data, None, mode, &mut context)?;

    if !options.is_merge() {
        let value = ObjectValue::new(MapValue::new(cleaned));
        return Ok(Mutation::set(key, value).with_field_transforms(context.transforms));
    }

    let mut leaf_paths = Vec::new();
    collect_leaf_paths(&cleaned, &[], &mut leaf_paths)?;
    leaf_paths.extend(context.deleted_fields.iter().cloned());

    let (mask, transforms) = match &options.merge_fields {
        Some(fields) => {
            validate_merge_fields(fields, &leaf_paths, &context.transforms)?;
            let mask = FieldMask::new(fields.iter().cloned());
            let transforms = context
                .transforms
                .into_iter()
                .filter(|transform| mask.covers(transform.field_path()))
                .collect();
            (mask, transforms)
        }
        None => (FieldMask::new(leaf_paths), context.transforms),
    };

    let value = ObjectValue::new(MapValue::new(cleaned));
    Ok(Mutation::patch(key, value, mask)
        .with_precondition(Precondition::None)
        .with_field_transforms(transforms))
}

/// Turns user data for an `update` into a patch. Keys are dot-separated
/// field paths; each one replaces the whole value at that path.
pub fn parse_update_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<Mutation> {
    if data.is_empty() {
        return Err(invalid_argument(
            "update requires at least one field/value pair",
        ));
    }
    let mut context = ParseContext::default();
    let mut value = ObjectValue::empty();
    let mut mask = Vec::new();

    for (field, field_value) in &data {
        let path = FieldPath::from_dot_separated(field)?;
        match field_value.as_sentinel() {
            Some(SentinelValue::Delete) => mask.push(path),
            Some(sentinel) => {
                context
                    .transforms
                    .push(transform_from_sentinel(path, sentinel)?);
            }
            None => {
                let parsed = parse_value(field_value, &path, ParseMode::Update, &mut context)?;
                if let Some(parsed) = parsed {
                    value.set(&path, parsed);
                    mask.push(path);
                }
            }
        }
    }

    Ok(Mutation::patch(key, value, FieldMask::new(mask))
        .with_field_transforms(context.transforms))
}

fn parse_map(
    data: &BTreeMap<String, FirestoreValue>,
    parent: Option<&FieldPath>,
    mode: ParseMode,
    context: &mut ParseContext,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (key, value) in data {
        let path = match parent {
            Some(parent) => parent.child(key.clone()),
            None => FieldPath::new([key.clone()])?,
        };
        if let Some(parsed) = parse_value(value, &path, mode, context)? {
            cleaned.insert(key.clone(), parsed);
        }
    }
    Ok(cleaned)
}

/// Returns the value to store at `path`, or `None` when a sentinel was
/// turned into a transform or a deletion.
fn parse_value(
    value: &FirestoreValue,
    path: &FieldPath,
    mode: ParseMode,
    context: &mut ParseContext,
) -> FirestoreResult<Option<FirestoreValue>> {
    match value.kind() {
        ValueKind::Sentinel(SentinelValue::Delete) => {
            if mode != ParseMode::MergeSet {
                return Err(invalid_argument(format!(
                    "delete() can only be used in update() or set() with merge (field '{}')",
                    path.canonical_string()
                )));
            }
            context.deleted_fields.push(path.clone());
            Ok(None)
        }
        ValueKind::Sentinel(sentinel) => {
            context
                .transforms
                .push(transform_from_sentinel(path.clone(), sentinel)?);
            Ok(None)
        }
        ValueKind::Map(map) => {
            let nested = parse_map(map.fields(), Some(path), mode, context)?;
            // An empty map is kept as a value unless all of its fields were sentinels.
            if nested.is_empty() && !map.fields().is_empty() {
                return Ok(None);
            }
            Ok(Some(FirestoreValue::from_map(nested)))
        }
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel(element, path)?;
            }
            Ok(Some(value.clone()))
        }
        _ => Ok(Some(value.clone())),
    }
}

fn transform_from_sentinel(
    path: FieldPath,
    sentinel: &SentinelValue,
) -> FirestoreResult<FieldTransform> {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in elements {
                assert_no_sentinel(element, &path)?;
            }
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                assert_no_sentinel(element, &path)?;
            }
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => match operand.kind() {
            ValueKind::Integer(_) | ValueKind::Double(_) => {
                TransformOperation::NumericIncrement(operand.as_ref().clone())
            }
            _ => {
                return Err(invalid_argument(
                    "increment() requires a numeric operand",
                ))
            }
        },
        SentinelValue::Delete => {
            return Err(invalid_argument(format!(
                "delete() cannot be nested inside another field value (field '{}')",
                path.canonical_string()
            )))
        }
    };
    Ok(FieldTransform::new(path, operation))
}

fn assert_no_sentinel(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays (field '{}').",
            context.canonical_string()
        ))),
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel(element, context)?;
            }
            Ok(())
        }
        ValueKind::Map(map) => {
            for element in map.fields().values() {
                assert_no_sentinel(element, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn collect_leaf_paths(
    data: &BTreeMap<String, FirestoreValue>,
    parent: &[String],
    acc: &mut Vec<FieldPath>,
) -> FirestoreResult<()> {
    for (key, value) in data {
        let mut segments = parent.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.fields().is_empty() => {
                collect_leaf_paths(map.fields(), &segments, acc)?;
            }
            _ => acc.push(FieldPath::new(segments)?),
        }
    }
    Ok(())
}

fn validate_merge_fields(
    fields: &[FieldPath],
    leaf_paths: &[FieldPath],
    transforms: &[FieldTransform],
) -> FirestoreResult<()> {
    for field in fields {
        let present = leaf_paths
            .iter()
            .chain(transforms.iter().map(FieldTransform::field_path))
            .any(|path| field.is_prefix_of(path) || path.is_prefix_of(field));
        if !present {
            return Err(invalid_argument(format!(
                "Field '{}' is specified in merge_fields but missing from the provided data",
                field.canonical_string()
            )));
        }
    }
    Ok(())
}
