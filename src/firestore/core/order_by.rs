use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::core::filter::document_field_value;
use crate::firestore::model::{Document, FieldPath, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        self.direction.apply(ordering)
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), suffix)
    }
}

/// A cursor position: one value per order by component.
///
/// `inclusive` decides whether a document sitting exactly at the position is
/// part of the result (`startAt`/`endAt`) or not (`startAfter`/`endBefore`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field().is_key_field() {
                match component.kind() {
                    ValueKind::Reference(path) => match ResourcePath::from_string(path) {
                        Ok(path) => path.cmp(document.key().path()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                match document_field_value(document, order.field()) {
                    Some(value) => compare_values(component, &value),
                    None => Ordering::Greater,
                }
            };
            let ordering = order.direction().apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether the document is at or after this bound when used as a start cursor.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether the document is at or before this bound when used as an end cursor.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub fn canonical_id(&self) -> String {
        let positions: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!(
            "{}:{}",
            if self.inclusive { "b" } else { "a" },
            positions.join(",")
        )
    }
}
