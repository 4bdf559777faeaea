use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch.
///
/// A mask covers a path when one of its entries is that path or a prefix of it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new([path("a"), path("b.c")]);
        assert!(mask.covers(&path("a.x")));
        assert!(mask.covers(&path("b.c")));
        assert!(!mask.covers(&path("b")));
    }

    #[test]
    fn union_deduplicates() {
        let mask = FieldMask::new([path("a")]).union_with([path("a"), path("b")]);
        assert_eq!(mask.len(), 2);
    }
}
