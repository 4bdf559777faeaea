//! Builders shared by unit tests.

mod path;

pub use path::{field, key, path};

use crate::firestore::core::Query;
use crate::firestore::model::{Document, FieldMask, ObjectValue, SnapshotVersion, Timestamp};
use crate::firestore::mutation::Mutation;
use crate::firestore::value::FirestoreValue;

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Object built from dotted field paths.
pub fn object(fields: &[(&str, FirestoreValue)]) -> ObjectValue {
    let mut object = ObjectValue::empty();
    for (name, value) in fields {
        object.set(&field(name), value.clone());
    }
    object
}

pub fn doc(path: &str, at: i64, fields: &[(&str, FirestoreValue)]) -> Document {
    Document::new_found_document(key(path), version(at), object(fields))
}

pub fn deleted_doc(path: &str, at: i64) -> Document {
    Document::new_no_document(key(path), version(at))
}

pub fn set_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    Mutation::set(key(path), object(fields))
}

/// Patch whose mask is exactly the given fields.
pub fn patch_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    let mask = FieldMask::new(fields.iter().map(|(name, _)| field(name)));
    Mutation::patch(key(path), object(fields), mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

pub fn collection_query(path_str: &str) -> Query {
    Query::collection(path(path_str))
}
