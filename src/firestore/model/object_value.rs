use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// The field map of a document, addressable by [`FieldPath`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectValue {
    map: MapValue,
}

impl ObjectValue {
    pub fn new(map: MapValue) -> Self {
        Self { map }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    pub fn map(&self) -> &MapValue {
        &self.map
    }

    pub fn into_map(self) -> MapValue {
        self.map
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.map.fields().get(first)?;
        for segment in rest {
            current = current.as_map()?.fields().get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(self.map.fields_mut(), path.segments(), value);
    }

    /// Removes the value at `path`. Missing parents are left untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(self.map.fields_mut(), path.segments());
    }

    /// Applies every entry; `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of this object. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self.map.fields(), &mut Vec::new(), &mut paths);
        FieldMask::new(paths)
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        values_equal(
            &FirestoreValue::from_map_value(self.map.clone()),
            &FirestoreValue::from_map_value(other.map.clone()),
        )
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
    if !matches!(entry.kind(), ValueKind::Map(_)) {
        *entry = FirestoreValue::from_map(BTreeMap::new());
    }
    if let Some(child) = entry.as_map_mut() {
        set_at_segments(child.fields_mut(), rest, value);
    }
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(child) = fields.get_mut(first).and_then(FirestoreValue::as_map_mut) {
        delete_at_segments(child.fields_mut(), rest);
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.as_map() {
            Some(child) if !child.is_empty() => collect_leaf_paths(child.fields(), prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(
            object.field(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );
        object.set(&path("a.b"), FirestoreValue::from_string("flat"));
        assert_eq!(object.field(&path("a.b.c")), None);
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_integer(1));
        object.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn delete_and_mask() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::from_integer(2));
        object.set(&path("d"), FirestoreValue::from_map(BTreeMap::new()));
        object.delete(&path("a.b"));
        let mask = object.field_mask();
        let fields: Vec<String> = mask.fields().map(FieldPath::canonical_string).collect();
        assert_eq!(fields, vec!["a.c".to_string(), "d".to_string()]);
    }
}
