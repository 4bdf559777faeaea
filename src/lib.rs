//! An offline-capable document store client.
//!
//! [`firestore::FirestoreClient`] keeps a local cache (in memory or in an
//! embedded database file) in sync with a backend reached through a
//! [`firestore::StreamingDatastore`]. Queries are answered from the cache and
//! updated live as the watch stream delivers changes; writes are visible
//! locally right away and acknowledged once the backend commits them.

pub mod firestore;
pub mod platform;
