use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{array_value_contains, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

/// A transform applied to one field of a document as part of a write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Local estimate of the transformed value before the server confirms it.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                numeric_increment(&self.compute_base_value(previous), operand)
            }
        }
    }

    /// Final value once the write was committed; `server_result` is what
    /// the backend reported for this transform.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                server_result.unwrap_or_else(|| {
                    self.apply_to_local_view(previous, Timestamp::now())
                })
            }
        }
    }

    /// Value the transform starts from, if it depends on the previous value.
    ///
    /// Only numeric increments have one: the previous number, or zero.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> FirestoreValue {
        match previous {
            Some(value) if value.is_number() => value.clone(),
            _ => FirestoreValue::from_integer(0),
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self.operation, TransformOperation::NumericIncrement(_))
    }
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let removals = crate::firestore::value::ArrayValue::new(removals.to_vec());
    let values = coerced_array(previous)
        .into_iter()
        .filter(|candidate| !array_value_contains(&removals, candidate))
        .collect();
    FirestoreValue::from_array(values)
}

/// Integer sums saturate at the i64 bounds; anything involving a double is a double.
fn numeric_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(operation: TransformOperation) -> FieldTransform {
        FieldTransform::new(FieldPath::from_dot_separated("f").unwrap(), operation)
    }

    #[test]
    fn increment_treats_non_numbers_as_zero() {
        let t = transform(TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)));
        let result = t.apply_to_local_view(Some(&"text".into()), Timestamp::now());
        assert_eq!(result, FirestoreValue::from_integer(2));
    }

    #[test]
    fn increment_saturates() {
        let t = transform(TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)));
        let result =
            t.apply_to_local_view(Some(&FirestoreValue::from_integer(i64::MAX)), Timestamp::now());
        assert_eq!(result, FirestoreValue::from_integer(i64::MAX));
    }

    #[test]
    fn increment_with_double_yields_double() {
        let t = transform(TransformOperation::NumericIncrement(FirestoreValue::from_double(0.5)));
        let result = t.apply_to_local_view(Some(&FirestoreValue::from_integer(1)), Timestamp::now());
        assert_eq!(result, FirestoreValue::from_double(1.5));
    }

    #[test]
    fn array_union_and_remove() {
        let existing = FirestoreValue::from_array(vec!["a".into(), "b".into()]);
        let union = transform(TransformOperation::ArrayUnion(vec!["b".into(), "c".into()]));
        assert_eq!(
            union.apply_to_local_view(Some(&existing), Timestamp::now()),
            FirestoreValue::from_array(vec!["a".into(), "b".into(), "c".into()])
        );
        let remove = transform(TransformOperation::ArrayRemove(vec!["a".into()]));
        assert_eq!(
            remove.apply_to_local_view(Some(&existing), Timestamp::now()),
            FirestoreValue::from_array(vec!["b".into()])
        );
    }

    #[test]
    fn server_timestamp_prefers_server_result() {
        let t = transform(TransformOperation::ServerTimestamp);
        let committed = FirestoreValue::from_timestamp(Timestamp::new(42, 0));
        assert_eq!(t.apply_to_remote_document(None, Some(committed.clone())), committed);
    }
}
