//! The seam between the remote store and the wire.
//!
//! A [`StreamingDatastore`] opens bidirectional message streams for the
//! listen and write protocols. Frames are opaque byte payloads; the JSON
//! codecs live in the stream wrappers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::FirestoreResult;

pub mod in_memory;

pub use in_memory::{InMemoryStreamingDatastore, ServerStream};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// One open bidirectional stream.
pub trait StreamHandle: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next frame from the server. `None` once the server hung up.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Called after the backend rejected the current token.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
