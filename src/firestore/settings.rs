use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::model::{DatabaseId, FieldPath};

/// Top-level configuration for a [`FirestoreClient`](crate::firestore::FirestoreClient).
#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceSettings,
    pub garbage_collection: GarbageCollectionSettings,
    pub query_engine: QueryEngineSettings,
    pub remote_store: RemoteStoreSettings,
    pub sync_engine: SyncEngineSettings,
    pub bloom_filter: BloomFilterSettings,
    /// Single-field equality indexes maintained by the index manager.
    pub field_indexes: Vec<FieldIndexSettings>,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default("local"),
            persistence: PersistenceSettings::default(),
            garbage_collection: GarbageCollectionSettings::default(),
            query_engine: QueryEngineSettings::default(),
            remote_store: RemoteStoreSettings::default(),
            sync_engine: SyncEngineSettings::default(),
            bloom_filter: BloomFilterSettings::default(),
            field_indexes: Vec::new(),
        }
    }
}

impl FirestoreSettings {
    pub fn with_database_id(mut self, database_id: DatabaseId) -> Self {
        self.database_id = database_id;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_field_index(mut self, index: FieldIndexSettings) -> Self {
        self.field_indexes.push(index);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PersistenceSettings {
    /// Process-lifetime storage; everything is lost on restart.
    #[default]
    Memory,
    /// An embedded database file at `path`.
    Durable { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GarbageCollectionSettings {
    /// Remove cached documents no longer referenced by any target, view or mutation
    /// as soon as a target is released.
    pub eager: bool,
}

impl Default for GarbageCollectionSettings {
    fn default() -> Self {
        Self { eager: true }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    /// Full scans over fewer documents than this never create an index.
    pub min_collection_size_to_auto_create: usize,
    /// How many times cheaper reading a document through an index is than a
    /// full scan read, as used by the auto-creation heuristic.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: false,
            min_collection_size_to_auto_create: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the current delay added or removed at random, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteStoreSettings {
    pub backoff: BackoffSettings,
    /// Mutation batches written to the stream but not yet acknowledged. The
    /// default keeps one batch in flight per connection.
    pub max_pending_writes: usize,
    /// Consecutive watch failures tolerated while the state is unknown before
    /// the client reports itself offline.
    pub max_watch_stream_failures: u32,
    /// Streams with nothing to do are closed after this long.
    pub idle_timeout: Duration,
}

impl Default for RemoteStoreSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffSettings::default(),
            max_pending_writes: 1,
            max_watch_stream_failures: 1,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEngineSettings {
    pub max_concurrent_limbo_resolutions: usize,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterSettings {
    /// Try to reconcile existence filter mismatches with the server's bloom
    /// filter before falling back to a full re-query.
    pub enabled: bool,
}

impl Default for BloomFilterSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldIndexSettings {
    pub collection_group: String,
    pub field: FieldPath,
}

impl FieldIndexSettings {
    pub fn new(collection_group: impl Into<String>, field: FieldPath) -> Self {
        Self {
            collection_group: collection_group.into(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.sync_engine.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.remote_store.max_pending_writes, 1);
        assert_eq!(settings.persistence, PersistenceSettings::Memory);
        assert!(settings.garbage_collection.eager);
        assert!(!settings.query_engine.index_auto_creation_enabled);
    }
}
