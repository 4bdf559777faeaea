use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::firestore::api::write_batch::WriteBatch;
use crate::firestore::core::{ListenOptions, Query, SnapshotCallback, ViewSnapshot};
use crate::firestore::error::{cancelled, failed_precondition, FirestoreResult};
use crate::firestore::local::{open_persistence, LocalStore, SyncEngine};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, DocumentSet};
use crate::firestore::mutation::Mutation;
use crate::firestore::remote::{NoopTokenProvider, StreamingDatastore, TokenProviderArc};
use crate::firestore::settings::FirestoreSettings;
use crate::platform::runtime;

struct ClientInner {
    settings: FirestoreSettings,
    sync_engine: Arc<SyncEngine>,
    terminated: AtomicBool,
}

/// Entry point of the sync engine: listens to queries, reads the local
/// cache and applies write batches.
///
/// Cloning is cheap; all clones share one local store and one set of
/// streams.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    /// Creates a client that talks to `datastore` without credentials.
    ///
    /// A durable persistence that fails to open is replaced by memory
    /// persistence and logged.
    pub fn new(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
    ) -> FirestoreResult<Self> {
        Self::with_token_provider(settings, datastore, Arc::new(NoopTokenProvider))
    }

    pub fn with_token_provider(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        let persistence = open_persistence(&settings.persistence);
        let local_store = Arc::new(LocalStore::new(persistence, &settings)?);
        let sync_engine = SyncEngine::new(local_store, datastore, token_provider, &settings);
        let starting = Arc::downgrade(&sync_engine);
        runtime::spawn_detached(async move {
            let Some(sync_engine) = starting.upgrade() else {
                return;
            };
            if let Err(err) = sync_engine.start().await {
                log::warn!("failed to resume pending writes: {err}");
            }
        });
        log::debug!(
            "client for {} started with {:?} persistence",
            settings.database_id,
            settings.persistence
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                settings,
                sync_engine,
                terminated: AtomicBool::new(false),
            }),
        })
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.settings.database_id
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.inner.sync_engine
    }

    /// Listens to `query`. The callback first receives the cached result and
    /// then every change until the registration is dropped.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let callback: SnapshotCallback = Arc::new(callback);
        let listener_id = self
            .inner
            .sync_engine
            .listen(query.clone(), options, callback)
            .await?;
        Ok(ListenerRegistration {
            sync_engine: Arc::downgrade(&self.inner.sync_engine),
            query,
            listener_id,
            active: true,
        })
    }

    /// Reads one document from the cache, including pending local writes.
    /// A cached deletion is returned as a missing document.
    pub async fn get_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        self.ensure_running()?;
        self.inner.sync_engine.get_document(key).await
    }

    /// Runs `query` against the cache.
    pub async fn get_documents(&self, query: &Query) -> FirestoreResult<DocumentSet> {
        self.ensure_running()?;
        self.inner.sync_engine.get_documents(query).await
    }

    /// Applies `mutations` atomically. Listeners see the change right away;
    /// the future resolves when the server acknowledges the batch and fails
    /// when it rejects it.
    pub async fn apply_batch(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.ensure_running()?;
        let receiver = self.inner.sync_engine.write(mutations).await?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("The write was dropped before it was acknowledged")),
        }
    }

    pub fn write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.ensure_running()?;
        self.inner.sync_engine.enable_network().await
    }

    /// Serves every read from the cache and queues writes until the network
    /// is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.ensure_running()?;
        self.inner.sync_engine.disable_network().await
    }

    /// Shuts the client down. Later calls fail with `FailedPrecondition`.
    pub async fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sync_engine.shutdown().await;
        log::debug!("client for {} terminated", self.inner.settings.database_id);
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated"));
        }
        Ok(())
    }
}

/// Handle of an active listener. Dropping it unsubscribes.
pub struct ListenerRegistration {
    sync_engine: Weak<SyncEngine>,
    query: Query,
    listener_id: u64,
    active: bool,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Unsubscribes and waits until the listener is removed.
    pub async fn remove(mut self) -> FirestoreResult<()> {
        self.active = false;
        match self.sync_engine.upgrade() {
            Some(sync_engine) => sync_engine.unlisten(&self.query, self.listener_id).await,
            None => Ok(()),
        }
    }

    /// Unsubscribes in the background.
    pub fn detach(self) {}
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Some(sync_engine) = self.sync_engine.upgrade() else {
            return;
        };
        let query = self.query.clone();
        let listener_id = self.listener_id;
        runtime::spawn_detached(async move {
            if let Err(err) = sync_engine.unlisten(&query, listener_id).await {
                log::warn!("failed to remove listener {listener_id}: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::InMemoryStreamingDatastore;
    use crate::firestore::value::FirestoreValue;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn settings() -> FirestoreSettings {
        FirestoreSettings::default().with_database_id(DatabaseId::new("p", "(default)"))
    }

    #[tokio::test]
    async fn offline_write_is_readable_from_cache() {
        let datastore = InMemoryStreamingDatastore::new();
        let client = FirestoreClient::new(settings(), Arc::new(datastore)).unwrap();
        client.disable_network().await.unwrap();

        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let mut batch = client.write_batch();
        batch
            .set(
                &key,
                BTreeMap::from([("likes".to_string(), FirestoreValue::from_integer(12))]),
            )
            .unwrap();
        let client_for_commit = client.clone();
        let commit = tokio::spawn(async move { batch.commit().await });

        let mut document = None;
        for _ in 0..400 {
            if let Ok(found) = client_for_commit.get_document(&key).await {
                document = Some(found);
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        let document = document.expect("document cached");
        assert!(document.has_local_mutations());

        client.terminate().await;
        let result = commit.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dropping_registration_unsubscribes() {
        let datastore = InMemoryStreamingDatastore::new();
        let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
        let received = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&received);
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        let registration = client
            .listen(query, ListenOptions::default(), move |_| {
                *counter.lock().unwrap() += 1;
            })
            .await
            .unwrap();
        // An empty cache result is held back until the backend answers.
        assert_eq!(*received.lock().unwrap(), 0);

        let server = datastore.accept_listen().await.unwrap();
        let add = server.recv_json().await.unwrap();
        drop(registration);
        let remove = server.recv_json().await.unwrap();
        assert_eq!(remove["removeTarget"], add["addTarget"]["targetId"]);
        client.terminate().await;
    }

    #[tokio::test]
    async fn terminated_client_rejects_calls() {
        let client =
            FirestoreClient::new(settings(), Arc::new(InMemoryStreamingDatastore::new())).unwrap();
        client.terminate().await;
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let err = client.get_document(&key).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        assert!(client.enable_network().await.is_err());
    }
}
