//! Offline-first document sync engine.
//!
//! Writes are applied to a local cache first and streamed to the backend in
//! order; query listeners see the merged view of cached server state and
//! pending local writes.

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod mutation;
pub mod remote;
pub mod settings;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{FirestoreClient, ListenerRegistration, SetOptions, WriteBatch};
pub use self::core::{
    ChangeType, Direction, DocumentViewChange, FilterOperator, ListenOptions, OnlineState, Query,
    ViewSnapshot,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::{DatabaseId, Document, DocumentKey, DocumentSet, FieldPath, ResourcePath};
pub use mutation::{Mutation, Precondition};
pub use remote::{InMemoryStreamingDatastore, ServerStream, StreamingDatastore, TokenProvider};
pub use settings::{FirestoreSettings, PersistenceSettings};
pub use value::FirestoreValue;
