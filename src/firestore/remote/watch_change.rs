use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::remote::rpc_error::decode_status;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message from the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving some targets.
///
/// `new_doc` is a found document for `documentChange`, a no-document for
/// `documentDelete` and `None` for `documentRemove`.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub new_doc: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Raw bloom filter shipped with an existence filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

/// The consistent snapshot version a listen response carries, if any. Only
/// global target changes (no target ids) with a read time mark one.
pub fn decode_snapshot_version(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match target_change.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => BASE64_STANDARD
            .decode(token)
            .map_err(|err| invalid_argument(format!("Invalid resumeToken: {err}")))?,
        None => Vec::new(),
    };
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);
    let cause = value.get("cause").map(decode_status);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_found_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_doc: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = read_time(serializer, value)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(Document::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(decode_bloom_filter)
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn decode_bloom_filter(value: &JsonValue) -> FirestoreResult<BloomFilterPayload> {
    let bits = value.get("bits");
    let bitmap = match bits
        .and_then(|bits| bits.get("bitmap"))
        .and_then(JsonValue::as_str)
    {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))?,
        None => Vec::new(),
    };
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let hash_count = value
        .get("hashCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    Ok(BloomFilterPayload {
        bitmap,
        padding,
        hash_count,
    })
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn read_time(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
    match value.get("readTime") {
        Some(time) => serializer.decode_version(time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as i32))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use serde_json::json;

    const ROOT: &str = "projects/project/databases/(default)/documents";

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn decode(value: JsonValue) -> WatchChange {
        decode_watch_change(&serializer(), &value)
            .unwrap()
            .expect("recognised change")
    }

    #[test]
    fn decodes_target_change() {
        let decoded = decode(json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        }));
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn removal_carries_cause() {
        let decoded = decode(json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "no access" }
            }
        }));
        let WatchChange::TargetChange(change) = decoded else {
            panic!("expected target change");
        };
        assert_eq!(change.state, TargetChangeState::Remove);
        assert_eq!(
            change.cause.map(|cause| cause.code),
            Some(FirestoreErrorCode::PermissionDenied)
        );
    }

    #[test]
    fn document_delete_becomes_no_document() {
        let decoded = decode(json!({
            "documentDelete": {
                "document": format!("{ROOT}/rooms/a"),
                "removedTargetIds": [2],
                "readTime": "1970-01-01T00:00:09Z"
            }
        }));
        let WatchChange::DocumentChange(change) = decoded else {
            panic!("expected document change");
        };
        assert!(change.updated_target_ids.is_empty());
        assert_eq!(change.removed_target_ids, vec![2]);
        let doc = change.new_doc.expect("no document");
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), SnapshotVersion::new(Timestamp::new(9, 0)));
    }

    #[test]
    fn document_remove_has_no_document() {
        let decoded = decode(json!({
            "documentRemove": { "document": format!("{ROOT}/rooms/a"), "removedTargetIds": [2] }
        }));
        let WatchChange::DocumentChange(change) = decoded else {
            panic!("expected document change");
        };
        assert!(change.new_doc.is_none());
        assert_eq!(change.key, DocumentKey::from_string("rooms/a").unwrap());
    }

    #[test]
    fn decodes_filter_with_bloom_filter() {
        let decoded = decode(json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0xffu8, 0x01]), "padding": 7 },
                    "hashCount": 4
                }
            }
        }));
        let WatchChange::ExistenceFilter(filter) = decoded else {
            panic!("expected filter");
        };
        assert_eq!(filter.count, 3);
        assert_eq!(
            filter.unchanged_names,
            Some(BloomFilterPayload {
                bitmap: vec![0xff, 0x01],
                padding: 7,
                hash_count: 4
            })
        );
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } });
        assert_eq!(
            decode_snapshot_version(&serializer, &global).unwrap(),
            SnapshotVersion::new(Timestamp::new(3, 0))
        );
        let targeted = json!({
            "targetChange": { "targetIds": [1], "readTime": "1970-01-01T00:00:03Z" }
        });
        assert!(decode_snapshot_version(&serializer, &targeted)
            .unwrap()
            .is_min());
        assert!(decode_snapshot_version(&serializer, &json!({ "filter": {} }))
            .unwrap()
            .is_min());
    }
}
