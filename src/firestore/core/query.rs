use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::filter::{Filter, FilterOperator};
use crate::firestore::core::order_by::{Bound, Direction, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentComparator, DocumentKey, FieldPath, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A client-side query over a single collection, a collection group or one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Matches documents in every collection with this id, anywhere below the root.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::collection(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::collection(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn with_filter(mut self, filter: Filter) -> FirestoreResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Document queries cannot be filtered"));
        }
        self.filters.push(filter);
        Ok(self)
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// The same constraints applied to one concrete collection, used to fan
    /// collection group queries out over their parents.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Fields constrained by an inequality anywhere in the filter tree, sorted.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op().is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order by, then any inequality field not already ordered, then the key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut normalized = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = normalized.iter().map(|o| o.field().clone()).collect();
        let last_direction = normalized
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                normalized.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_field()) {
            normalized.push(OrderBy::new(FieldPath::key_field(), last_direction));
        }
        normalized
    }

    pub fn matches(&self, document: &Document) -> bool {
        if !document.is_found_document() || !self.matches_path(document.key()) {
            return false;
        }
        let order_by = self.normalized_order_by();
        order_by
            .iter()
            .all(|o| o.field().is_key_field() || document.field(o.field()).is_some())
            && self.filters.iter().all(|filter| filter.matches(document))
            && self
                .start_at
                .as_ref()
                .map(|bound| bound.sorts_before_document(&order_by, document))
                .unwrap_or(true)
            && self
                .end_at
                .as_ref()
                .map(|bound| bound.sorts_after_document(&order_by, document))
                .unwrap_or(true)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(key.path())
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == key.path()
        } else {
            self.path.is_immediate_parent_of(key.path())
        }
    }

    /// Orders documents the way results of this query are presented.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for component in &order_by {
                match component.compare_documents(left, right) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        })
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), suffix)
    }

    /// Convenience for the common `field op value` filter.
    pub fn where_field(
        self,
        field: &str,
        op: FilterOperator,
        value: impl Into<crate::firestore::value::FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let filter = Filter::field(FieldPath::from_dot_separated(field)?, op, value.into())?;
        self.with_filter(filter)
    }
}
