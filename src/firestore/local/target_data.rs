use serde::{Deserialize, Serialize};

use crate::firestore::core::Target;
use crate::firestore::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// Re-listen after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch the bloom filter could not reconcile.
    ExistenceFilterMismatchBloom,
    /// A single-document target resolving a limbo document.
    LimboResolution,
}

/// Everything the client tracks about one target, persisted in the target cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    pub sequence_number: i64,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Last snapshot version at which the target's view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "crate::firestore::value::bytes_value::base64_bytes")]
    pub resume_token: Vec<u8>,
    /// Documents the server reported for the target on resume, checked
    /// against the next existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: TargetPurpose, sequence_number: i64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A new resume token invalidates any expected count taken from the old one.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: Option<i32>) -> Self {
        self.expected_count = expected_count;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
