use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    code: Option<JsonValue>,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a `google.rpc.Status` as it appears in watch causes and stream
/// error frames. The code may be the numeric gRPC status or its name.
pub fn decode_status(value: &JsonValue) -> FirestoreError {
    let body = serde_json::from_value::<StatusBody>(value.clone()).unwrap_or(StatusBody {
        code: None,
        message: None,
    });
    let code = match body.code {
        Some(JsonValue::Number(number)) => number
            .as_i64()
            .map(FirestoreErrorCode::from_status)
            .unwrap_or(FirestoreErrorCode::Internal),
        Some(JsonValue::String(name)) => map_status_name(&name),
        _ => FirestoreErrorCode::Internal,
    };
    let message = body
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("Stream closed with status {}", code.as_str()));
    FirestoreError::new(code, message)
}

fn map_status_name(status: &str) -> FirestoreErrorCode {
    match status {
        "CANCELLED" => FirestoreErrorCode::Cancelled,
        "INVALID_ARGUMENT" | "OUT_OF_RANGE" => FirestoreErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
        "NOT_FOUND" => FirestoreErrorCode::NotFound,
        "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
        "ABORTED" => FirestoreErrorCode::Aborted,
        "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
        "DATA_LOSS" => FirestoreErrorCode::DataLoss,
        "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Internal,
    }
}
