use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    InvalidArgument,
    Internal,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Cancelled,
    DataLoss,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
        }
    }

    /// Maps a gRPC status number carried on the wire to an error code.
    pub fn from_status(status: i64) -> Self {
        match status {
            1 => FirestoreErrorCode::Cancelled,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Internal,
        }
    }

    /// Application-level rejections that are terminal for one operation.
    ///
    /// Everything else is transient infrastructure and is retried with backoff.
    pub fn is_permanent(&self) -> bool {
        match self {
            FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated => false,
            FirestoreErrorCode::InvalidArgument
            | FirestoreErrorCode::NotFound
            | FirestoreErrorCode::AlreadyExists
            | FirestoreErrorCode::PermissionDenied
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::Aborted
            | FirestoreErrorCode::DataLoss => true,
        }
    }

    /// Aborted writes are retried even though aborted is otherwise permanent.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() && *self != FirestoreErrorCode::Aborted
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

/// Persistence could not complete the operation but may succeed later.
pub fn persistence_unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::Unavailable,
        format!("persistence unavailable: {}", message.into()),
    )
}

/// Persisted data could not be decoded.
pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = failed_precondition("missing document");
        assert_eq!(err.to_string(), "missing document (firestore/failed-precondition)");
    }

    #[test]
    fn classifies_permanent_codes() {
        assert!(FirestoreErrorCode::PermissionDenied.is_permanent());
        assert!(!FirestoreErrorCode::Unavailable.is_permanent());
        assert!(FirestoreErrorCode::Aborted.is_permanent());
        assert!(!FirestoreErrorCode::Aborted.is_permanent_write_error());
    }

    #[test]
    fn maps_status_numbers() {
        assert_eq!(FirestoreErrorCode::from_status(9), FirestoreErrorCode::FailedPrecondition);
        assert_eq!(FirestoreErrorCode::from_status(14), FirestoreErrorCode::Unavailable);
        assert_eq!(FirestoreErrorCode::from_status(99), FirestoreErrorCode::Internal);
    }
}
