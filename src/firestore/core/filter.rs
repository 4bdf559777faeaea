use std::borrow::Cow;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, FieldPath};
use crate::firestore::value::{
    array_value_contains, canonical_id, compare_values, type_order, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    /// Operators that constrain a range of values and therefore imply an order by.
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// Reads `path` from `document`, resolving the key field to a reference.
pub(crate) fn document_field_value<'a>(
    document: &'a Document,
    path: &FieldPath,
) -> Option<Cow<'a, FirestoreValue>> {
    if path.is_key_field() {
        return Some(Cow::Owned(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        )));
    }
    document.field(path).map(Cow::Borrowed)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Filter operator '{}' requires an array value",
                op.as_str()
            )));
        }
        if field.is_key_field() {
            if matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                return Err(invalid_argument(format!(
                    "Filter operator '{}' cannot be used on the document id",
                    op.as_str()
                )));
            }
            let all_references = match value.as_array() {
                Some(array) if op.takes_array() => array
                    .values()
                    .iter()
                    .all(|item| matches!(item.kind(), ValueKind::Reference(_))),
                _ => matches!(value.kind(), ValueKind::Reference(_)),
            };
            if !all_references {
                return Err(invalid_argument(
                    "Document id filters require reference values",
                ));
            }
        }
        if value.as_sentinel().is_some() {
            return Err(invalid_argument("Sentinel values cannot be used in filters"));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        let other = document_field_value(document, &self.field);
        let other = other.as_deref();
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array_value_contains(array, &self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles
                    .values()
                    .iter()
                    .any(|needle| array_value_contains(array, needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => array_value_contains(candidates, other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if array_value_contains(candidates, &FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !array_value_contains(candidates, other),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) => {
                    !other.is_null()
                        && self
                            .op
                            .matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
            _ => match other {
                Some(other) => {
                    type_order(other) == type_order(&self.value)
                        && self
                            .op
                            .matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

/// A predicate over documents: a single field comparison or an AND/OR tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(document)),
            },
        }
    }

    /// Every field filter in the tree, depth first.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened)
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let inner: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                // A conjunction of field filters canonicalizes like the flat list.
                match composite.op {
                    CompositeOperator::And => inner.join(","),
                    CompositeOperator::Or => format!("or({})", inner.join(",")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, ObjectValue, SnapshotVersion};

    fn doc(fields: &[(&str, FirestoreValue)]) -> Document {
        let mut data = ObjectValue::empty();
        for (name, value) in fields {
            data.set(&FieldPath::from_dot_separated(name).unwrap(), value.clone());
        }
        Document::new_found_document(
            DocumentKey::from_string("posts/p1").unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn filter(field: &str, op: FilterOperator, value: FirestoreValue) -> Filter {
        Filter::field(FieldPath::from_dot_separated(field).unwrap(), op, value).unwrap()
    }

    #[test]
    fn range_filters_require_same_type() {
        let document = doc(&[("likes", 12.into())]);
        assert!(filter("likes", FilterOperator::GreaterThan, 10.into()).matches(&document));
        assert!(!filter("likes", FilterOperator::GreaterThan, "10".into()).matches(&document));
        assert!(!filter("missing", FilterOperator::LessThan, 10.into()).matches(&document));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let document = doc(&[("a", FirestoreValue::null())]);
        assert!(!filter("a", FilterOperator::NotEqual, 1.into()).matches(&document));
        assert!(!filter("b", FilterOperator::NotEqual, 1.into()).matches(&document));
        assert!(filter("a", FilterOperator::NotEqual, 1.into())
            .matches(&doc(&[("a", 2.into())])));
    }

    #[test]
    fn array_operators() {
        let document = doc(&[("tags", FirestoreValue::from_array(vec!["x".into(), "y".into()]))]);
        assert!(filter("tags", FilterOperator::ArrayContains, "x".into()).matches(&document));
        assert!(filter(
            "tags",
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "y".into()])
        )
        .matches(&document));
        assert!(filter(
            "tags",
            FilterOperator::In,
            FirestoreValue::from_array(vec![FirestoreValue::from_array(vec![
                "x".into(),
                "y".into()
            ])])
        )
        .matches(&document));
    }

    #[test]
    fn not_in_with_null_never_matches() {
        let document = doc(&[("a", 1.into())]);
        let candidates = FirestoreValue::from_array(vec![FirestoreValue::null(), 2.into()]);
        assert!(!filter("a", FilterOperator::NotIn, candidates).matches(&document));
        let candidates = FirestoreValue::from_array(vec![2.into()]);
        assert!(filter("a", FilterOperator::NotIn, candidates).matches(&document));
    }

    #[test]
    fn composite_or() {
        let document = doc(&[("a", 1.into())]);
        let either = Filter::or(vec![
            filter("a", FilterOperator::Equal, 2.into()),
            filter("a", FilterOperator::Equal, 1.into()),
        ]);
        assert!(either.matches(&document));
        assert_eq!(either.flattened().len(), 2);
    }

    #[test]
    fn key_filters_need_references() {
        assert!(Filter::field(FieldPath::key_field(), FilterOperator::Equal, "posts/p1".into()).is_err());
        let by_key = filter_key(FirestoreValue::from_reference("posts/p1"));
        assert!(by_key.matches(&doc(&[])));
    }

    fn filter_key(value: FirestoreValue) -> Filter {
        Filter::field(FieldPath::key_field(), FilterOperator::Equal, value).unwrap()
    }

    #[test]
    fn in_requires_array_value() {
        assert!(FieldFilter::new(
            FieldPath::from_dot_separated("a").unwrap(),
            FilterOperator::In,
            1.into()
        )
        .is_err());
    }
}
