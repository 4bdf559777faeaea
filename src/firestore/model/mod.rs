mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_mask;
mod field_path;
mod geo_point;
mod object_value;
mod resource_path;
mod timestamp;

use std::collections::{BTreeMap, BTreeSet};

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use object_value::ObjectValue;
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};

/// Documents keyed by their path.
pub type DocumentMap = BTreeMap<DocumentKey, Document>;
pub type DocumentKeySet = BTreeSet<DocumentKey>;
