use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use serde_json::Value as JsonValue;

use super::{box_stream_future, StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};

/// How long the server side waits for the client before giving up.
const SERVER_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Listen,
    Write,
}

/// A process-local backend: every stream the client opens shows up as a
/// [`ServerStream`] that the embedding code (usually a test) drives by hand.
#[derive(Clone)]
pub struct InMemoryStreamingDatastore {
    inner: Arc<Inner>,
}

struct Inner {
    listen_accept: (Sender<ServerStream>, Receiver<ServerStream>),
    write_accept: (Sender<ServerStream>, Receiver<ServerStream>),
    open_failures: StdMutex<VecDeque<FirestoreError>>,
    listen_opened: AtomicUsize,
    write_opened: AtomicUsize,
}

impl Default for InMemoryStreamingDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamingDatastore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listen_accept: async_channel::unbounded(),
                write_accept: async_channel::unbounded(),
                open_failures: StdMutex::new(VecDeque::new()),
                listen_opened: AtomicUsize::new(0),
                write_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next stream open attempt, of either kind, fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        if let Ok(mut failures) = self.inner.open_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Waits for the client to open its next listen stream.
    pub async fn accept_listen(&self) -> Option<ServerStream> {
        accept(&self.inner.listen_accept.1).await
    }

    /// Waits for the client to open its next write stream.
    pub async fn accept_write(&self) -> Option<ServerStream> {
        accept(&self.inner.write_accept.1).await
    }

    pub fn listen_streams_opened(&self) -> usize {
        self.inner.listen_opened.load(Ordering::SeqCst)
    }

    pub fn write_streams_opened(&self) -> usize {
        self.inner.write_opened.load(Ordering::SeqCst)
    }

    fn open(
        &self,
        kind: StreamKind,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let injected = self
            .inner
            .open_failures
            .lock()
            .map_err(|_| internal_error("in-memory datastore lock poisoned"))?
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let (to_server, from_client) = async_channel::unbounded();
        let (to_client, from_server) = async_channel::unbounded();
        let server = ServerStream {
            auth_token,
            to_client,
            from_client,
        };
        let (accept, counter) = match kind {
            StreamKind::Listen => (&self.inner.listen_accept.0, &self.inner.listen_opened),
            StreamKind::Write => (&self.inner.write_accept.0, &self.inner.write_opened),
        };
        accept
            .try_send(server)
            .map_err(|_| unavailable("in-memory backend is gone"))?;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryStreamHandle {
            outgoing: to_server,
            incoming: from_server,
        }))
    }
}

async fn accept(receiver: &Receiver<ServerStream>) -> Option<ServerStream> {
    tokio::time::timeout(SERVER_WAIT, receiver.recv())
        .await
        .ok()
        .and_then(Result::ok)
}

impl StreamingDatastore for InMemoryStreamingDatastore {
    fn open_listen_stream(
        &self,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        box_stream_future(async move { self.open(StreamKind::Listen, auth_token) })
    }

    fn open_write_stream(
        &self,
        auth_token: Option<String>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        box_stream_future(async move { self.open(StreamKind::Write, auth_token) })
    }
}

struct InMemoryStreamHandle {
    outgoing: Sender<Vec<u8>>,
    incoming: Receiver<FirestoreResult<Vec<u8>>>,
}

impl StreamHandle for InMemoryStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.outgoing
                .send(payload)
                .await
                .map_err(|_| unavailable("stream closed by server"))
        })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        box_stream_future(async move { self.incoming.recv().await.ok() })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.outgoing.close();
            self.incoming.close();
            Ok(())
        })
    }
}

/// The backend's end of one client stream. Dropping it hangs up.
pub struct ServerStream {
    auth_token: Option<String>,
    to_client: Sender<FirestoreResult<Vec<u8>>>,
    from_client: Receiver<Vec<u8>>,
}

impl ServerStream {
    /// Token the client presented when it opened the stream.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub async fn send_json(&self, message: &JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| internal_error(format!("failed to encode frame: {err}")))?;
        self.to_client
            .send(Ok(payload))
            .await
            .map_err(|_| unavailable("stream closed by client"))
    }

    /// Next request from the client, waiting a few seconds at most.
    pub async fn recv_json(&self) -> Option<JsonValue> {
        self.recv_json_within(SERVER_WAIT).await
    }

    pub async fn recv_json_within(&self, wait: Duration) -> Option<JsonValue> {
        let payload = tokio::time::timeout(wait, self.from_client.recv())
            .await
            .ok()?
            .ok()?;
        serde_json::from_slice(&payload).ok()
    }

    /// Ends the stream with an error status, as the backend does for
    /// rejected writes or expired credentials.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.to_client.send(Err(error)).await;
        self.to_client.close();
    }

    pub fn close(&self) {
        self.to_client.close();
    }

    /// Whether the client has closed its end.
    pub fn is_closed(&self) -> bool {
        self.from_client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use serde_json::json;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let datastore = InMemoryStreamingDatastore::new();
        let client = datastore
            .open_listen_stream(Some("token-1".into()))
            .await
            .expect("open listen stream");
        let server = datastore.accept_listen().await.expect("server side");
        assert_eq!(server.auth_token(), Some("token-1"));
        assert_eq!(datastore.listen_streams_opened(), 1);

        client.send(br#"{"hello":1}"#.to_vec()).await.unwrap();
        assert_eq!(server.recv_json().await, Some(json!({"hello": 1})));

        server.send_json(&json!({"reply": true})).await.unwrap();
        let frame = client.next().await.expect("frame").expect("payload");
        assert_eq!(frame, br#"{"reply":true}"#.to_vec());

        client.close().await.unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn failing_stream_delivers_error_then_ends() {
        let datastore = InMemoryStreamingDatastore::new();
        let client = datastore.open_write_stream(None).await.unwrap();
        let server = datastore.accept_write().await.unwrap();
        server.fail(permission_denied("nope")).await;
        let err = client.next().await.expect("error frame").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_open_failure_is_consumed_once() {
        let datastore = InMemoryStreamingDatastore::new();
        datastore.fail_next_open(unavailable("offline"));
        assert!(datastore.open_listen_stream(None).await.is_err());
        assert!(datastore.open_listen_stream(None).await.is_ok());
        assert_eq!(datastore.listen_streams_opened(), 1);
    }
}
