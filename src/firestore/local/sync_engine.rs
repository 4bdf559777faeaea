//! The sync engine: turns local writes and remote events into view
//! snapshots, resolves limbo documents and reports write acknowledgements.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use async_lock::Mutex;
use futures::channel::oneshot;

use crate::firestore::core::{
    EventManager, LimboDocumentChange, ListenOptions, ListenerEvent, OnlineState, Query,
    SnapshotCallback, Target, TargetIdGenerator, View, ViewChange, ViewDocumentChanges,
    ViewSnapshot,
};
use crate::firestore::error::{
    cancelled, failed_precondition, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::{LocalStore, LocalViewChanges};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, SnapshotVersion,
};
use crate::firestore::mutation::{Mutation, MutationBatch, MutationBatchResult};
use crate::firestore::remote::datastore::{StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
use crate::firestore::remote::{JsonProtoSerializer, RemoteEvent, RemoteStore, RemoteSyncer};
use crate::firestore::settings::FirestoreSettings;

/// Resolves once the server acknowledged or rejected a batch.
pub type WriteReceiver = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    target_id: i32,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target delivered the document, so its remote keys contain it.
    received_document: bool,
}

/// Remote store calls produced while the limbo bookkeeping was locked.
enum RemoteOp {
    Listen(TargetData),
    Unlisten(i32),
}

/// Limbo documents and the document targets resolving them. At most
/// `max_active` resolutions run at once; the rest wait in FIFO order.
struct LimboResolutions {
    document_refs: ReferenceSet,
    targets_by_key: BTreeMap<DocumentKey, i32>,
    resolutions_by_target: BTreeMap<i32, LimboResolution>,
    enqueued: VecDeque<DocumentKey>,
    target_ids: TargetIdGenerator,
    max_active: usize,
}

impl LimboResolutions {
    fn new(max_active: usize) -> Self {
        Self {
            document_refs: ReferenceSet::new(),
            targets_by_key: BTreeMap::new(),
            resolutions_by_target: BTreeMap::new(),
            enqueued: VecDeque::new(),
            target_ids: TargetIdGenerator::for_sync_engine(),
            max_active: max_active.max(1),
        }
    }

    fn update_tracked(
        &mut self,
        target_id: i32,
        changes: Vec<LimboDocumentChange>,
        ops: &mut Vec<RemoteOp>,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.document_refs.add_reference(key.clone(), target_id);
                    self.track(key, ops);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    self.document_refs.remove_reference(&key, target_id);
                    if !self.document_refs.contains_key(&key) {
                        self.remove(&key, ops);
                    }
                }
            }
        }
    }

    fn track(&mut self, key: DocumentKey, ops: &mut Vec<RemoteOp>) {
        if self.targets_by_key.contains_key(&key) || self.enqueued.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued.push_back(key);
        self.pump(ops);
    }

    /// Stops resolving `key`, whether it is active or still queued.
    fn remove(&mut self, key: &DocumentKey, ops: &mut Vec<RemoteOp>) {
        self.enqueued.retain(|queued| queued != key);
        let Some(target_id) = self.targets_by_key.remove(key) else {
            return;
        };
        self.resolutions_by_target.remove(&target_id);
        ops.push(RemoteOp::Unlisten(target_id));
        self.pump(ops);
    }

    /// Drops every limbo reference held by a view target.
    fn remove_target(&mut self, target_id: i32, ops: &mut Vec<RemoteOp>) {
        for key in self.document_refs.remove_references_for_id(target_id) {
            if !self.document_refs.contains_key(&key) {
                self.remove(&key, ops);
            }
        }
    }

    /// Forgets a resolution whose target the server already removed.
    fn forget(&mut self, target_id: i32, ops: &mut Vec<RemoteOp>) -> Option<DocumentKey> {
        let resolution = self.resolutions_by_target.remove(&target_id)?;
        self.targets_by_key.remove(&resolution.key);
        self.pump(ops);
        Some(resolution.key)
    }

    fn pump(&mut self, ops: &mut Vec<RemoteOp>) {
        while self.targets_by_key.len() < self.max_active {
            let Some(key) = self.enqueued.pop_front() else {
                break;
            };
            let target_id = self.target_ids.next_id();
            self.targets_by_key.insert(key.clone(), target_id);
            ops.push(RemoteOp::Listen(limbo_target_data(&key, target_id)));
            self.resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key,
                    received_document: false,
                },
            );
        }
    }
}

fn limbo_target_data(key: &DocumentKey, target_id: i32) -> TargetData {
    TargetData::new(
        Target::for_document(key),
        target_id,
        TargetPurpose::LimboResolution,
        0,
    )
}

struct SyncEngineState {
    event_manager: EventManager,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<Query>>,
    pending_writes: BTreeMap<i32, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
    terminated: bool,
}

/// Coordinates the local store, the remote store and query listeners.
///
/// All view state lives behind one async lock. Listener callbacks run after
/// that lock is released.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    state: Mutex<SyncEngineState>,
    limbo: StdMutex<LimboResolutions>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        settings: &FirestoreSettings,
    ) -> Arc<Self> {
        let serializer = JsonProtoSerializer::new(settings.database_id.clone());
        Arc::new_cyclic(|weak: &Weak<SyncEngine>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            SyncEngine {
                local_store,
                remote_store: RemoteStore::new(
                    datastore,
                    token_provider,
                    serializer,
                    settings.remote_store.clone(),
                    settings.bloom_filter.enabled,
                    syncer,
                ),
                state: Mutex::new(SyncEngineState {
                    event_manager: EventManager::new(),
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    pending_writes: BTreeMap::new(),
                    online_state: OnlineState::Unknown,
                    terminated: false,
                }),
                limbo: StdMutex::new(LimboResolutions::new(
                    settings.sync_engine.max_concurrent_limbo_resolutions,
                )),
            }
        })
    }

    /// Sends the mutation batches a previous session left unacknowledged.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.remote_store.fill_write_pipeline().await
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    fn limbo(&self) -> MutexGuard<'_, LimboResolutions> {
        self.limbo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener for `query` and returns its id. The first
    /// listener of a query allocates a target and starts watching it.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> FirestoreResult<u64> {
        let mut events = Vec::new();
        let listener_id = {
            let mut state = self.state.lock().await;
            if state.terminated {
                return Err(terminated_error());
            }
            let (listener_id, first, replay) =
                state.event_manager.add_listener(&query, options, callback);
            events.extend(replay);
            if first {
                match self.listen_to_query(&mut state, &query).await {
                    Ok(snapshot) => {
                        events.extend(state.event_manager.on_watch_change(snapshot.into_iter().collect()));
                    }
                    Err(err) => {
                        state
                            .event_manager
                            .remove_listener(&query.canonical_id(), listener_id);
                        return Err(err);
                    }
                }
            }
            listener_id
        };
        dispatch(events);
        Ok(listener_id)
    }

    async fn listen_to_query(
        &self,
        state: &mut SyncEngineState,
        query: &Query,
    ) -> FirestoreResult<Option<ViewSnapshot>> {
        let canonical_id = query.canonical_id();
        if state.query_views.contains_key(&canonical_id) {
            return Ok(None);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let (view, view_change) = match self.initial_view(query) {
            Ok(initial) => initial,
            Err(err) => {
                if let Err(release_err) = self.local_store.release_target(target_id) {
                    log::warn!("failed to release target {target_id}: {release_err}");
                }
                return Err(err);
            }
        };

        let mut ops = Vec::new();
        self.limbo()
            .update_tracked(target_id, view_change.limbo_changes, &mut ops);
        state.query_views.insert(
            canonical_id,
            QueryView {
                target_id,
                view,
            },
        );
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());

        self.remote_store.listen(target_data).await;
        self.run_remote_ops(ops).await;
        Ok(view_change.snapshot)
    }

    /// Builds a view of `query` from the cache.
    fn initial_view(&self, query: &Query) -> FirestoreResult<(View, ViewChange)> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = self.compute_changes(&view, &result.documents, None)?;
        let view_change = view.apply_changes(changes, true, None, false);
        Ok((view, view_change))
    }

    /// Removes a listener. The last listener of a target releases it locally
    /// and stops watching it.
    pub async fn unlisten(&self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let canonical_id = query.canonical_id();
        if state
            .event_manager
            .remove_listener(&canonical_id, listener_id)
            .is_none()
        {
            return Ok(());
        }
        let Some(query_view) = state.query_views.remove(&canonical_id) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        let remaining = match state.queries_by_target.get_mut(&target_id) {
            Some(queries) => {
                queries.retain(|other| other.canonical_id() != canonical_id);
                queries.len()
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(());
        }

        self.local_store.release_target(target_id)?;
        if !state.terminated {
            self.remote_store.unlisten(target_id).await;
        }
        let events = self.remove_and_cleanup_target(&mut state, target_id, None).await;
        drop(state);
        dispatch(events);
        Ok(())
    }

    /// Queues `mutations` as one batch and applies them to every view. The
    /// returned receiver resolves when the server acknowledges or rejects it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteReceiver> {
        let (sender, receiver) = oneshot::channel();
        let (batch_id, events) = {
            let mut state = self.state.lock().await;
            if state.terminated {
                return Err(terminated_error());
            }
            let result = self.local_store.write_locally(mutations)?;
            state
                .pending_writes
                .entry(result.batch_id)
                .or_default()
                .push(sender);
            let events = self.emit_new_snapshots(&mut state, result.changes, None).await?;
            (result.batch_id, events)
        };
        dispatch(events);
        // The batch is durable in the mutation queue; the next refill sends it.
        if let Err(err) = self.remote_store.fill_write_pipeline().await {
            log::warn!("failed to queue batch {batch_id} for sending: {err}");
        }
        Ok(receiver)
    }

    /// Best-known local state of one document. A cached deletion is returned
    /// as a missing document; a document the cache knows nothing about is an
    /// error.
    pub async fn get_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let document = self.local_store.read_document(key)?;
        if document.is_found_document() || document.is_no_document() {
            return Ok(document);
        }
        Err(unavailable(format!(
            "Failed to get document {key} from cache. The document may exist on the server \
             but the client has not cached it"
        )))
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents(&self, query: &Query) -> FirestoreResult<DocumentSet> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = self.compute_changes(&view, &result.documents, None)?;
        let view_change = view.apply_changes(changes, false, None, false);
        Ok(match view_change.snapshot {
            Some(snapshot) => snapshot.docs,
            None => DocumentSet::new(query.comparator()),
        })
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.remote_store.enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.remote_store.disable_network().await
    }

    /// Stops all network activity. Writes still waiting for an
    /// acknowledgement stay queued locally; their receivers are cancelled.
    pub async fn shutdown(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            state.terminated = true;
            std::mem::take(&mut state.pending_writes)
        };
        self.remote_store.shutdown().await;
        for sender in pending.into_values().flatten() {
            let _ = sender.send(Err(cancelled(
                "The client was terminated before the write was acknowledged",
            )));
        }
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.online_state
    }

    /// Limbo documents currently being resolved, with their target ids.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, i32> {
        self.limbo().targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot, oldest first.
    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.limbo().enqueued.iter().cloned().collect()
    }

    fn compute_changes(
        &self,
        view: &View,
        documents: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let changes = view.compute_doc_changes(documents, previous);
        if !changes.needs_refill {
            return Ok(changes);
        }
        // The limit edge moved: re-run the query without previous results.
        let result = self.local_store.execute_query(view.query(), false)?;
        Ok(view.compute_doc_changes(&result.documents, Some(changes)))
    }

    /// Folds `changes` into every view, raises the resulting snapshots and
    /// reports view membership back to the local store.
    async fn emit_new_snapshots(
        &self,
        state: &mut SyncEngineState,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Vec<ListenerEvent>> {
        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut ops = Vec::new();

        for query_view in state.query_views.values_mut() {
            let target_id = query_view.target_id;
            let doc_changes = self.compute_changes(&query_view.view, &changes, None)?;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event
                .map(|event| event.target_mismatches.contains_key(&target_id))
                .unwrap_or(false);
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
            self.limbo()
                .update_tracked(target_id, view_change.limbo_changes, &mut ops);
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        let events = state.event_manager.on_watch_change(snapshots);
        self.local_store.notify_local_view_changes(&local_view_changes)?;
        self.run_remote_ops(ops).await;
        Ok(events)
    }

    /// Drops every query of a released target, delivering `error` to its
    /// listeners when the server removed the target.
    async fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
        error: Option<FirestoreError>,
    ) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        for query in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            state.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                events.extend(state.event_manager.on_watch_error(&query, error.clone()));
            }
        }
        let mut ops = Vec::new();
        self.limbo().remove_target(target_id, &mut ops);
        self.run_remote_ops(ops).await;
        events
    }

    async fn run_remote_ops(&self, ops: Vec<RemoteOp>) {
        for op in ops {
            match op {
                RemoteOp::Listen(target_data) => {
                    log::debug!(
                        "resolving limbo document with target {}",
                        target_data.target_id
                    );
                    self.remote_store.listen(target_data).await;
                }
                RemoteOp::Unlisten(target_id) => self.remote_store.unlisten(target_id).await,
            }
        }
    }

    fn resolve_write(state: &mut SyncEngineState, batch_id: i32, result: FirestoreResult<()>) {
        for sender in state.pending_writes.remove(&batch_id).unwrap_or_default() {
            let _ = sender.send(result.clone());
        }
    }

    async fn handle_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut limbo = self.limbo();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = limbo.resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.removed_documents.is_empty() {
                    resolution.received_document = false;
                }
            }
        }

        let events = {
            let mut state = self.state.lock().await;
            let changes = self.local_store.apply_remote_event(&event)?;
            self.emit_new_snapshots(&mut state, changes, Some(&event)).await?
        };
        dispatch(events);
        Ok(())
    }

    async fn handle_rejected_listen(
        &self,
        target_id: i32,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let mut ops = Vec::new();
        let limbo_key = self.limbo().forget(target_id, &mut ops);
        if let Some(key) = limbo_key {
            // The document cannot be read: treat it as deleted so it leaves limbo.
            log::debug!("limbo resolution for {key} rejected: {error}");
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                Document::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            self.handle_remote_event(event).await?;
            self.run_remote_ops(ops).await;
            return Ok(());
        }

        log::warn!("listen for target {target_id} failed: {error}");
        let events = {
            let mut state = self.state.lock().await;
            self.local_store.release_target(target_id)?;
            self.remove_and_cleanup_target(&mut state, target_id, Some(error))
                .await
        };
        dispatch(events);
        Ok(())
    }

    async fn handle_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let events = {
            let mut state = self.state.lock().await;
            let changes = self.local_store.acknowledge_batch(&result)?;
            Self::resolve_write(&mut state, batch_id, Ok(()));
            self.emit_new_snapshots(&mut state, changes, None).await?
        };
        dispatch(events);
        Ok(())
    }

    async fn handle_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("write batch {batch_id} rejected: {error}");
        let events = {
            let mut state = self.state.lock().await;
            let changes = self.local_store.reject_batch(batch_id)?;
            Self::resolve_write(&mut state, batch_id, Err(error));
            self.emit_new_snapshots(&mut state, changes, None).await?
        };
        dispatch(events);
        Ok(())
    }

    async fn handle_online_state_change(&self, online_state: OnlineState) {
        let events = {
            let mut state = self.state.lock().await;
            state.online_state = online_state;
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            let mut events = state.event_manager.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                events.extend(state.event_manager.on_watch_change(snapshots));
            }
            events
        };
        log::debug!("online state is now {online_state:?}");
        dispatch(events);
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_remote_event(event))
    }

    fn reject_listen(
        &self,
        target_id: i32,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_rejected_listen(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_successful_write(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_failed_write(batch_id, error))
    }

    fn apply_online_state_change(&self, state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(self.handle_online_state_change(state))
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet {
        if let Some(resolution) = self.limbo().resolutions_by_target.get(&target_id) {
            let mut keys = DocumentKeySet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        match self.local_store.get_remote_document_keys(target_id) {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("failed to read remote keys for target {target_id}: {err}");
                DocumentKeySet::new()
            }
        }
    }

    fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.local_store.last_stream_token()
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(token)
    }

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.get_last_remote_snapshot_version()
    }
}

fn dispatch(events: Vec<ListenerEvent>) {
    for event in events {
        event.dispatch();
    }
}

fn terminated_error() -> FirestoreError {
    failed_precondition("The client has already been terminated")
}
