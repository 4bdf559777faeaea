use crate::firestore::model::{DocumentKey, FieldPath, ResourcePath};

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).unwrap()
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}
