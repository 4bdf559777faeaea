use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Rank of each value kind in the cross-type sort order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    String,
    Blob,
    Reference,
    GeoPoint,
    Array,
    Object,
    Sentinel,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Blob,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) => TypeOrder::Object,
        ValueKind::Sentinel(_) => TypeOrder::Sentinel,
    }
}

/// Equality used by array membership and document comparison.
///
/// Integers and doubles are never equal to each other, while NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits() || a == b
        }
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a
                    .values()
                    .iter()
                    .zip(b.values())
                    .all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().all(|(key, value)| {
                    b.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        _ => left == right,
    }
}

/// Total order over all values, consistent with server-side ordering.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    match (ResourcePath::from_string(left), ResourcePath::from_string(right)) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.values().len().cmp(&right.values().len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields()) {
        match lk.cmp(rk).then_with(|| compare_values(lv, rv)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

pub fn array_value_contains(array: &ArrayValue, needle: &FirestoreValue) -> bool {
    array
        .values()
        .iter()
        .any(|candidate| values_equal(candidate, needle))
}

/// Stable textual form of a value, used to build canonical target ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&d.to_string()),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(b) => out.push_str(&b.to_base64()),
        ValueKind::Reference(path) => out.push_str(path),
        ValueKind::GeoPoint(point) => {
            out.push_str(&format!("geo({},{})", point.latitude(), point.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, item) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, item)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        ValueKind::Sentinel(sentinel) => out.push_str(match sentinel {
            SentinelValue::ServerTimestamp => "serverTimestamp()",
            SentinelValue::ArrayUnion(_) => "arrayUnion()",
            SentinelValue::ArrayRemove(_) => "arrayRemove()",
            SentinelValue::NumericIncrement(_) => "increment()",
            SentinelValue::Delete => "delete()",
        }),
    }
}
