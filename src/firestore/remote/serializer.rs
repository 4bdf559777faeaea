use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{
    Bound, CompositeOperator, Direction, Filter, FilterOperator, OrderBy, Target,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldPath, GeoPoint, ObjectValue, ResourcePath,
    SnapshotVersion, Timestamp,
};
use crate::firestore::mutation::{
    FieldTransform, Mutation, MutationResult, Precondition, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between the local model and the JSON mapping of the Firestore
/// protocol used on the listen and write streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    /// Parses a fully qualified document name, rejecting names that belong
    /// to another database.
    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!("Document name '{name}' is not in {root}"))
            })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => encode_double(*double),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": encode_timestamp(timestamp) })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(path) => match ResourcePath::from_string(path) {
                Ok(path) => json!({ "referenceValue": self.resource_name(&path) }),
                Err(_) => json!({ "referenceValue": path }),
            },
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values = array
                    .values()
                    .iter()
                    .map(|value| self.encode_value(value))
                    .collect::<Vec<_>>();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({
                "mapValue": {
                    "fields": self.encode_map_fields(map)
                }
            }),
            // Sentinels are lifted into field transforms before a mutation is queued.
            ValueKind::Sentinel(_) => json!({ "nullValue": JsonValue::Null }),
        }
    }

    fn encode_map_fields(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (key, value) in map.fields() {
            fields.insert(key.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => match value.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            let timestamp_str = timestamp_value
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
            return Ok(FirestoreValue::from_timestamp(parse_timestamp(
                timestamp_str,
            )?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let str_value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(str_value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let str_value = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let decoded = BASE64_STANDARD
                .decode(str_value)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(BytesValue::from(decoded)));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let key = self.document_key_from_name(name)?;
            return Ok(FirestoreValue::from_reference(
                key.path().canonical_string(),
            ));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point
                .get("latitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or_default();
            let longitude = geo_point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or_default();
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
                latitude, longitude,
            )?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(decoded));
        }
        if let Some(map_value) = object.get("mapValue") {
            let map = self.decode_map_value(map_value)?;
            return Ok(FirestoreValue::from_map_value(map));
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        let fields_object = match value.get("fields") {
            Some(fields_value) => fields_value
                .as_object()
                .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
            None => return Ok(MapValue::new(BTreeMap::new())),
        };

        let mut fields = BTreeMap::new();
        for (key, value) in fields_object {
            fields.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(fields))
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(encode_timestamp(&version.timestamp()))
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected RFC 3339 timestamp string"))?;
        parse_timestamp(text).map(SnapshotVersion::from)
    }

    /// Decodes a `Document` message into a found document at its update time.
    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.document_key_from_name(name)?;
        let version = value
            .get("updateTime")
            .map(|time| self.decode_version(time))
            .transpose()?
            .ok_or_else(|| invalid_argument("Document is missing updateTime"))?;
        let data = ObjectValue::new(self.decode_map_value(value)?);
        Ok(Document::new_found_document(key, version, data))
    }

    pub fn encode_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_map_fields(data.map()),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".into(), self.encode_document(key, value));
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert("update".into(), self.encode_document(key, data));
                let paths = field_mask
                    .fields()
                    .map(FieldPath::canonical_string)
                    .collect::<Vec<_>>();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".into(), json!(self.document_name(key)));
            }
            Mutation::Transform { key, .. } => {
                write.insert(
                    "transform".into(),
                    json!({ "document": self.document_name(key) }),
                );
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".into(), json!(self.document_name(key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            let encoded = transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect::<Vec<_>>();
            match write.get_mut("transform") {
                Some(JsonValue::Object(transform)) => {
                    transform.insert("fieldTransforms".into(), JsonValue::Array(encoded));
                }
                _ => {
                    write.insert("updateTransforms".into(), JsonValue::Array(encoded));
                }
            }
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".into(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path().canonical_string();
        let encode_all = |elements: &[FirestoreValue]| {
            elements
                .iter()
                .map(|value| self.encode_value(value))
                .collect::<Vec<_>>()
        };
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": encode_all(elements) }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": encode_all(elements) }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    /// Decodes one entry of `writeResults`. Results without an update time
    /// (verify and no-op writes) take the commit version.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime") {
            Some(time) => self.decode_version(time)?,
            None => commit_version,
        };
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array)
        {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_value(entry))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    /// Encodes the `addTarget` payload for a watch request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".into(), json!(target_data.target_id));
        if target.is_document_target() {
            encoded.insert(
                "documents".into(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            encoded.insert("query".into(), self.encode_query_target(target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".into(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".into(),
                self.encode_version(target_data.snapshot_version),
            );
        }
        if let Some(count) = target_data.expected_count {
            encoded.insert("expectedCount".into(), json!(count));
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = serde_json::Map::new();
        let parent = match &target.collection_group {
            Some(group) => {
                structured.insert(
                    "from".into(),
                    json!([{ "collectionId": group, "allDescendants": true }]),
                );
                self.resource_name(&target.path)
            }
            None => {
                let collection_id = target.path.last_segment().unwrap_or_default();
                structured.insert("from".into(), json!([{ "collectionId": collection_id }]));
                self.resource_name(&target.path.without_last())
            }
        };

        match target.filters.len() {
            0 => {}
            1 => {
                structured.insert("where".into(), self.encode_filter(&target.filters[0]));
            }
            _ => {
                let filters = target
                    .filters
                    .iter()
                    .map(|filter| self.encode_filter(filter))
                    .collect::<Vec<_>>();
                structured.insert(
                    "where".into(),
                    json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
                );
            }
        }

        if !target.order_by.is_empty() {
            let order_by = target.order_by.iter().map(encode_order_by).collect::<Vec<_>>();
            structured.insert("orderBy".into(), JsonValue::Array(order_by));
        }
        if let Some(limit) = target.limit {
            structured.insert("limit".into(), json!(limit));
        }
        if let Some(start) = &target.start_at {
            structured.insert("startAt".into(), self.encode_bound(start, start.inclusive()));
        }
        if let Some(end) = &target.end_at {
            structured.insert("endAt".into(), self.encode_bound(end, !end.inclusive()));
        }

        json!({ "parent": parent, "structuredQuery": structured })
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => {
                let field = json!({ "fieldPath": field_filter.field().canonical_string() });
                let value = field_filter.value();
                let unary = match field_filter.op() {
                    FilterOperator::Equal if value.is_null() => Some("IS_NULL"),
                    FilterOperator::Equal if value.is_nan() => Some("IS_NAN"),
                    FilterOperator::NotEqual if value.is_null() => Some("IS_NOT_NULL"),
                    FilterOperator::NotEqual if value.is_nan() => Some("IS_NOT_NAN"),
                    _ => None,
                };
                match unary {
                    Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
                    None => json!({
                        "fieldFilter": {
                            "field": field,
                            "op": wire_operator(field_filter.op()),
                            "value": self.encode_value(value),
                        }
                    }),
                }
            }
            Filter::Composite(composite) => {
                let op = match composite.op() {
                    CompositeOperator::And => "AND",
                    CompositeOperator::Or => "OR",
                };
                let filters = composite
                    .filters()
                    .iter()
                    .map(|filter| self.encode_filter(filter))
                    .collect::<Vec<_>>();
                json!({ "compositeFilter": { "op": op, "filters": filters } })
            }
        }
    }

    fn encode_bound(&self, bound: &Bound, before: bool) -> JsonValue {
        let values = bound
            .position()
            .iter()
            .map(|value| self.encode_value(value))
            .collect::<Vec<_>>();
        json!({ "values": values, "before": before })
    }
}

fn encode_order_by(order_by: &OrderBy) -> JsonValue {
    let direction = match order_by.direction() {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    };
    json!({
        "field": { "fieldPath": order_by.field().canonical_string() },
        "direction": direction,
    })
}

fn wire_operator(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() && value.is_sign_positive() {
        json!({ "doubleValue": "Infinity" })
    } else if value.is_infinite() {
        json!({ "doubleValue": "-Infinity" })
    } else {
        json!({ "doubleValue": value })
    }
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    let nanos = u32::try_from(timestamp.nanos).unwrap_or_default();
    Utc.timestamp_opt(timestamp.seconds, nanos)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::FieldMask;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn document_names_round_trip() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
        let name = serializer.document_name(&key);
        assert_eq!(
            name,
            "projects/project/databases/(default)/documents/rooms/eros/messages/1"
        );
        assert_eq!(serializer.document_key_from_name(&name).unwrap(), key);
        assert!(serializer
            .document_key_from_name("projects/other/databases/(default)/documents/a/b")
            .is_err());
    }

    #[test]
    fn decodes_found_document() {
        let serializer = serializer();
        let document = serializer
            .decode_found_document(&json!({
                "name": "projects/project/databases/(default)/documents/users/ada",
                "fields": {
                    "age": { "integerValue": "36" },
                    "friend": { "referenceValue": "projects/project/databases/(default)/documents/users/bob" },
                    "score": { "doubleValue": "NaN" }
                },
                "updateTime": "2024-05-01T10:00:00.000000500Z"
            }))
            .unwrap();
        assert!(document.is_found_document());
        assert_eq!(document.version().timestamp().nanos, 500);
        assert_eq!(
            document.field(&field("age")),
            Some(&FirestoreValue::from_integer(36))
        );
        assert_eq!(
            document.field(&field("friend")),
            Some(&FirestoreValue::from_reference("users/bob"))
        );
        assert!(document.field(&field("score")).unwrap().is_nan());
    }

    #[test]
    fn encodes_patch_with_mask_transforms_and_precondition() {
        let serializer = serializer();
        let key = DocumentKey::from_string("users/ada").unwrap();
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        let mutation = Mutation::patch(
            key,
            ObjectValue::from_fields(data),
            FieldMask::new(vec![field("name")]),
        )
        .with_field_transforms(vec![FieldTransform::new(
            field("visits"),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
        )]);

        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["name"]));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(
            encoded["updateTransforms"][0]["increment"],
            json!({ "integerValue": "1" })
        );
        assert_eq!(
            encoded["update"]["fields"]["name"],
            json!({ "stringValue": "Ada" })
        );
    }

    #[test]
    fn encodes_delete_and_verify() {
        let serializer = serializer();
        let key = DocumentKey::from_string("users/ada").unwrap();
        let delete = serializer.encode_mutation(&Mutation::delete(key.clone()));
        assert_eq!(
            delete,
            json!({ "delete": "projects/project/databases/(default)/documents/users/ada" })
        );
        let verify = serializer.encode_mutation(&Mutation::verify(
            key,
            Precondition::UpdateTime(SnapshotVersion::new(Timestamp::new(1, 0))),
        ));
        assert_eq!(
            verify["currentDocument"]["updateTime"],
            json!("1970-01-01T00:00:01.000000000Z")
        );
    }

    #[test]
    fn write_result_defaults_to_commit_version() {
        let serializer = serializer();
        let commit = SnapshotVersion::new(Timestamp::new(10, 0));
        let result = serializer.decode_write_result(&json!({}), commit).unwrap();
        assert_eq!(result.version, commit);
        assert!(result.transform_results.is_empty());

        let result = serializer
            .decode_write_result(
                &json!({
                    "updateTime": "1970-01-01T00:00:05Z",
                    "transformResults": [{ "integerValue": "3" }]
                }),
                commit,
            )
            .unwrap();
        assert_eq!(result.version, SnapshotVersion::new(Timestamp::new(5, 0)));
        assert_eq!(
            result.transform_results,
            vec![FirestoreValue::from_integer(3)]
        );
    }

    #[test]
    fn encodes_query_target_with_resume_token() {
        let serializer = serializer();
        let query = Query::collection(ResourcePath::from_string("rooms/eros/messages").unwrap())
            .where_field("likes", FilterOperator::GreaterThan, 10)
            .unwrap()
            .with_limit_to_first(5);
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![1, 2, 3], SnapshotVersion::new(Timestamp::new(3, 0)))
            .with_expected_count(Some(4));

        let encoded = serializer.encode_target(&target_data);
        assert_eq!(encoded["targetId"], json!(2));
        assert_eq!(encoded["resumeToken"], json!("AQID"));
        assert_eq!(encoded["expectedCount"], json!(4));
        assert!(encoded.get("readTime").is_none());
        let query = &encoded["query"];
        assert_eq!(
            query["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        let structured = &query["structuredQuery"];
        assert_eq!(structured["from"], json!([{ "collectionId": "messages" }]));
        assert_eq!(structured["where"]["fieldFilter"]["op"], json!("GREATER_THAN"));
        assert_eq!(structured["limit"], json!(5));
        assert_eq!(
            structured["orderBy"][0]["field"]["fieldPath"],
            json!("likes")
        );
    }

    #[test]
    fn encodes_document_target_with_read_time() {
        let serializer = serializer();
        let key = DocumentKey::from_string("users/ada").unwrap();
        let mut target_data = TargetData::new(
            Target::for_document(&key),
            1,
            TargetPurpose::LimboResolution,
            -1,
        );
        target_data.snapshot_version = SnapshotVersion::new(Timestamp::new(2, 0));
        let encoded = serializer.encode_target(&target_data);
        assert_eq!(
            encoded["documents"]["documents"],
            json!(["projects/project/databases/(default)/documents/users/ada"])
        );
        assert_eq!(encoded["readTime"], json!("1970-01-01T00:00:02.000000000Z"));
    }

    #[test]
    fn null_equality_becomes_unary_filter() {
        let serializer = serializer();
        let filter = Filter::field(field("deleted"), FilterOperator::Equal, FirestoreValue::null())
            .unwrap();
        assert_eq!(
            serializer.encode_filter(&filter),
            json!({ "unaryFilter": { "field": { "fieldPath": "deleted" }, "op": "IS_NULL" } })
        );
    }
}
