use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::SnapshotVersion;
use crate::firestore::mutation::{Mutation, MutationResult};
use crate::firestore::remote::datastore::{
    box_stream_future, StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate, StreamKind};
use crate::firestore::settings::BackoffSettings;

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_write_stream_open(&self);

    /// The server answered the handshake with a fresh stream token.
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()>;

    /// Returns whether the stream should reconnect.
    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> bool;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

/// The write stream: a handshake followed by batches of writes, each
/// echoing the most recent stream token.
pub struct WriteStream {
    stream: Arc<PersistentStream<WriteStreamHandler>>,
    handler: Arc<WriteStreamHandler>,
}

impl WriteStream {
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        delegate: Weak<dyn WriteStreamDelegate>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        let handler = Arc::new(WriteStreamHandler {
            serializer,
            delegate,
            state: StdMutex::new(WriteStreamState::default()),
        });
        let stream = Arc::new(PersistentStream::new(
            datastore,
            token_provider,
            Arc::clone(&handler),
            StreamKind::Write,
            backoff,
            idle_timeout,
        ));
        Self { stream, handler }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.handler.lock().handshake_complete = false;
        self.stream.stop();
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        self.handler.lock().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.handler.lock().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.handler.lock().last_stream_token = token;
    }

    /// First request on a fresh connection; the server replies with a token.
    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        let request = json!({ "database": self.handler.serializer.database_name() });
        self.send(&request).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let state = self.handler.lock();
            if !state.handshake_complete {
                return Err(failed_precondition(
                    "Cannot write mutations before the handshake completes",
                ));
            }
            state.last_stream_token.clone()
        };
        let serializer = &self.handler.serializer;
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "streamToken": BASE64_STANDARD.encode(token),
            "writes": writes,
        });
        self.send(&request).await
    }

    async fn send(&self, request: &JsonValue) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
        self.stream.send(bytes).await
    }
}

struct WriteStreamHandler {
    serializer: JsonProtoSerializer,
    delegate: Weak<dyn WriteStreamDelegate>,
    state: StdMutex<WriteStreamState>,
}

impl WriteStreamHandler {
    fn lock(&self) -> MutexGuard<'_, WriteStreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_response(&self, value: JsonValue) -> FirestoreResult<()> {
        let token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map_err(|err| internal_error(format!("Invalid streamToken: {err}")))?,
            None => Vec::new(),
        };
        let first_response = {
            let mut state = self.lock();
            state.last_stream_token = token.clone();
            !std::mem::replace(&mut state.handshake_complete, true)
        };
        let Some(delegate) = self.delegate.upgrade() else {
            return Ok(());
        };

        if first_response {
            return delegate.on_handshake_complete(token).await;
        }

        let commit_version = match value.get("commitTime") {
            Some(time) => self.serializer.decode_version(time)?,
            None => SnapshotVersion::min(),
        };
        let results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.serializer.decode_write_result(entry, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        delegate.on_mutation_result(commit_version, results, token).await
    }
}

impl PersistentStreamDelegate for WriteStreamHandler {
    fn stream_label(&self) -> &'static str {
        "write"
    }

    fn on_stream_open(
        &self,
        _stream: Arc<dyn StreamHandle>,
    ) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.lock().handshake_complete = false;
            if let Some(delegate) = self.delegate.upgrade() {
                delegate.on_write_stream_open().await;
            }
            Ok(())
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let value: JsonValue = serde_json::from_slice(&message).map_err(|err| {
                internal_error(format!("Failed to decode write response: {err}"))
            })?;
            self.handle_response(value).await
        })
    }

    fn on_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, bool> {
        box_stream_future(async move {
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_write_stream_close(error).await,
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, DocumentKey, ObjectValue};
    use crate::firestore::remote::datastore::{InMemoryStreamingDatastore, NoopTokenProvider};
    use crate::platform::runtime;

    #[derive(Default)]
    struct Recorder {
        handshakes: StdMutex<Vec<Vec<u8>>>,
        results: StdMutex<Vec<(SnapshotVersion, Vec<MutationResult>, Vec<u8>)>>,
    }

    #[async_trait]
    impl WriteStreamDelegate for Recorder {
        async fn on_write_stream_open(&self) {}

        async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
            self.handshakes.lock().unwrap().push(stream_token);
            Ok(())
        }

        async fn on_mutation_result(
            &self,
            commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
            stream_token: Vec<u8>,
        ) -> FirestoreResult<()> {
            self.results
                .lock()
                .unwrap()
                .push((commit_version, results, stream_token));
            Ok(())
        }

        async fn on_write_stream_close(&self, _error: Option<FirestoreError>) -> bool {
            false
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn handshake_then_writes_echo_stream_token() {
        let datastore = InMemoryStreamingDatastore::new();
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn WriteStreamDelegate> = recorder.clone();
        let stream = WriteStream::new(
            Arc::new(datastore.clone()),
            Arc::new(NoopTokenProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
            Arc::downgrade(&delegate),
            BackoffSettings::default(),
            Duration::from_secs(60),
        );
        stream.start();
        let server = datastore.accept_write().await.unwrap();
        wait_until(|| stream.is_open()).await;

        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let mutation = Mutation::set(key, ObjectValue::empty());
        assert!(stream.write_mutations(&[mutation.clone()]).await.is_err());

        stream.write_handshake().await.unwrap();
        assert_eq!(
            server.recv_json().await,
            Some(json!({ "database": "projects/p/databases/(default)" }))
        );
        server.send_json(&json!({ "streamToken": "dG9rMQ==" })).await.unwrap();
        wait_until(|| stream.handshake_complete()).await;
        assert_eq!(recorder.handshakes.lock().unwrap().as_slice(), &[b"tok1".to_vec()]);

        stream.write_mutations(&[mutation]).await.unwrap();
        let request = server.recv_json().await.unwrap();
        assert_eq!(request["streamToken"], "dG9rMQ==");
        assert_eq!(
            request["writes"][0]["update"]["name"],
            "projects/p/databases/(default)/documents/rooms/eros"
        );

        server
            .send_json(&json!({
                "streamToken": "dG9rMg==",
                "commitTime": "2024-01-01T00:00:05Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:04Z" }]
            }))
            .await
            .unwrap();
        wait_until(|| recorder.results.lock().unwrap().len() == 1).await;
        let (commit, results, token) = recorder.results.lock().unwrap()[0].clone();
        assert_eq!(commit.timestamp().seconds, 1_704_067_205);
        assert_eq!(results[0].version.timestamp().seconds, 1_704_067_204);
        assert_eq!(token, b"tok2".to_vec());
        assert_eq!(stream.last_stream_token(), b"tok2".to_vec());
        stream.stop();
        assert!(!stream.handshake_complete());
    }
}
