mod array_value;
pub(crate) mod bytes_value;
mod map_value;
mod value;
mod value_order;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use value::{FirestoreValue, SentinelValue, ValueKind};
pub use value_order::{
    array_value_contains, canonical_id, compare_values, type_order, values_equal, TypeOrder,
};
