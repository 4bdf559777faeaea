use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::datastore::{
    box_stream_future, StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate, StreamKind};
use crate::firestore::remote::watch_change::{
    decode_snapshot_version, decode_watch_change, WatchChange,
};
use crate::firestore::settings::BackoffSettings;

#[async_trait]
pub trait WatchStreamDelegate: Send + Sync + 'static {
    async fn on_watch_stream_open(&self);

    /// `snapshot_version` is non-min only for global target changes that
    /// mark a consistent snapshot.
    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    /// Returns whether the stream should reconnect.
    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> bool;
}

/// The listen stream: adds and removes targets and hands decoded watch
/// changes to its delegate.
pub struct WatchStream {
    stream: Arc<PersistentStream<WatchStreamHandler>>,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        delegate: Weak<dyn WatchStreamDelegate>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        let handler = Arc::new(WatchStreamHandler {
            serializer: serializer.clone(),
            delegate,
        });
        let stream = Arc::new(PersistentStream::new(
            datastore,
            token_provider,
            handler,
            StreamKind::Listen,
            backoff,
            idle_timeout,
        ));
        Self { stream, serializer }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
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

    /// Registers a target, resuming from its resume token or read time.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "addTarget": self.serializer.encode_target(target_data),
        });
        self.send(&request).await
    }

    pub async fn unwatch(&self, target_id: i32) -> FirestoreResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.send(&request).await
    }

    async fn send(&self, request: &JsonValue) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        self.stream.send(bytes).await
    }
}

struct WatchStreamHandler {
    serializer: JsonProtoSerializer,
    delegate: Weak<dyn WatchStreamDelegate>,
}

impl PersistentStreamDelegate for WatchStreamHandler {
    fn stream_label(&self) -> &'static str {
        "listen"
    }

    fn on_stream_open(
        &self,
        _stream: Arc<dyn StreamHandle>,
    ) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            if let Some(delegate) = self.delegate.upgrade() {
                delegate.on_watch_stream_open().await;
            }
            Ok(())
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let value: JsonValue = serde_json::from_slice(&message).map_err(|err| {
                internal_error(format!("Failed to decode listen response: {err}"))
            })?;
            let Some(change) = decode_watch_change(&self.serializer, &value)? else {
                log::debug!("Ignoring unrecognized listen response");
                return Ok(());
            };
            let version = decode_snapshot_version(&self.serializer, &value)?;
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_watch_change(change, version).await,
                None => Ok(()),
            }
        })
    }

    fn on_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, bool> {
        box_stream_future(async move {
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_watch_stream_close(error).await,
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::datastore::{InMemoryStreamingDatastore, NoopTokenProvider};
    use crate::firestore::remote::watch_change::TargetChangeState;
    use crate::platform::runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        changes: StdMutex<Vec<(WatchChange, SnapshotVersion)>>,
    }

    #[async_trait]
    impl WatchStreamDelegate for Recorder {
        async fn on_watch_stream_open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_watch_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> FirestoreResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_stream_close(&self, _error: Option<FirestoreError>) -> bool {
            false
        }
    }

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    async fn open_stream(
        datastore: &InMemoryStreamingDatastore,
        recorder: &Arc<Recorder>,
    ) -> WatchStream {
        let delegate: Arc<dyn WatchStreamDelegate> = recorder.clone();
        let stream = WatchStream::new(
            Arc::new(datastore.clone()),
            Arc::new(NoopTokenProvider),
            serializer(),
            Arc::downgrade(&delegate),
            BackoffSettings::default(),
            Duration::from_secs(60),
        );
        stream.start();
        for _ in 0..200 {
            if stream.is_open() {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert!(stream.is_open());
        stream
    }

    #[tokio::test]
    async fn sends_add_and_remove_target_requests() {
        let datastore = InMemoryStreamingDatastore::new();
        let recorder = Arc::new(Recorder::default());
        let stream = open_stream(&datastore, &recorder).await;
        let server = datastore.accept_listen().await.unwrap();
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);

        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        let target: Target = query.to_target();
        let target_data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(b"tok".to_vec(), SnapshotVersion::min());
        stream.watch(&target_data).await.unwrap();
        let add = server.recv_json().await.unwrap();
        assert_eq!(add["database"], "projects/p/databases/(default)");
        assert_eq!(add["addTarget"]["targetId"], 2);
        assert_eq!(add["addTarget"]["resumeToken"], "dG9r");

        stream.unwatch(2).await.unwrap();
        let remove = server.recv_json().await.unwrap();
        assert_eq!(remove["removeTarget"], 2);
        stream.stop();
    }

    #[tokio::test]
    async fn forwards_decoded_changes_with_snapshot_version() {
        let datastore = InMemoryStreamingDatastore::new();
        let recorder = Arc::new(Recorder::default());
        let stream = open_stream(&datastore, &recorder).await;
        let server = datastore.accept_listen().await.unwrap();

        server
            .send_json(&json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2] } }))
            .await
            .unwrap();
        server.send_json(&json!({ "somethingElse": {} })).await.unwrap();
        server
            .send_json(&json!({
                "targetChange": { "readTime": "2024-01-01T00:00:01Z", "resumeToken": "dG9r" }
            }))
            .await
            .unwrap();

        for _ in 0..200 {
            if recorder.changes.lock().unwrap().len() == 2 {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 2);
        match &changes[0] {
            (WatchChange::TargetChange(change), version) => {
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(version.is_min());
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert!(!changes[1].1.is_min());
        stream.stop();
    }
}
