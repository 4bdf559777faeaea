use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::{Mutex, MutexGuard};
use async_trait::async_trait;

use crate::firestore::core::OnlineState;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{DocumentKeySet, SnapshotVersion};
use crate::firestore::mutation::{MutationBatch, MutationBatchResult, MutationResult};
use crate::firestore::remote::datastore::{StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    WatchStream, WatchStreamDelegate, WriteStream, WriteStreamDelegate,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::remote::RemoteEvent;
use crate::firestore::settings::RemoteStoreSettings;
use crate::platform::runtime;

/// Reasons the remote store keeps its streams closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets the sync engine listens to, with the latest resume tokens.
    listen_targets: BTreeMap<i32, TargetData>,
    /// Present while a watch stream is running.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// The open watch stream has been sent every listen target.
    watch_open: bool,
    /// Batches sent, or about to be sent, on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    /// The write stream answered the handshake and was sent the pipeline.
    write_handshake_complete: bool,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineStateTracker,
    /// Online state changes not yet handed to the syncer, oldest first.
    pending_online_states: Vec<OnlineState>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn record_online_state(&mut self, change: Option<OnlineState>) {
        if let Some(state) = change {
            log::debug!("Online state changed to {state:?}");
            self.pending_online_states.push(state);
        }
    }
}

/// Aggregator view of the targets: target data comes from the listen set,
/// remote keys from the local cache.
struct ListenTargetsProvider<'a> {
    listen_targets: &'a BTreeMap<i32, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetsProvider<'_> {
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the watch and write streams and keeps them in step with the set of
/// listened targets and the local mutation queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    /// Streams start out enabled but only connect once there is a target to
    /// listen to or a batch to write.
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: RemoteStoreSettings,
        bloom_filter_enabled: bool,
        syncer: Weak<dyn RemoteSyncer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_delegate: Weak<dyn WatchStreamDelegate> = weak.clone();
            let write_delegate: Weak<dyn WriteStreamDelegate> = weak.clone();
            RemoteStoreInner {
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_aggregator: None,
                    watch_open: false,
                    write_pipeline: VecDeque::new(),
                    write_handshake_complete: false,
                    offline_causes: BTreeSet::new(),
                    online_state: OnlineStateTracker::new(settings.max_watch_stream_failures),
                    pending_online_states: Vec::new(),
                }),
                online_delivery: Mutex::new(()),
                watch_stream: WatchStream::new(
                    Arc::clone(&datastore),
                    Arc::clone(&token_provider),
                    serializer.clone(),
                    watch_delegate,
                    settings.backoff.clone(),
                    settings.idle_timeout,
                ),
                write_stream: WriteStream::new(
                    datastore,
                    token_provider,
                    serializer.clone(),
                    write_delegate,
                    settings.backoff.clone(),
                    settings.idle_timeout,
                ),
                serializer,
                bloom_filter_enabled,
                max_pending_writes: settings.max_pending_writes.max(1),
                syncer,
            }
        });
        Self { inner }
    }

    /// Clears a user-initiated `disable_network` and reconnects as needed.
    /// The syncer has seen the resulting online state when this returns.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let result = {
            let mut state = self.inner.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
            self.inner.enable_network_locked(&mut state).await
        };
        self.inner.deliver_online_states().await;
        result
    }

    /// Closes both streams, drops the unacknowledged write pipeline and
    /// reports `Offline` until the network is enabled again. The syncer has
    /// seen `Offline` when this returns.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        {
            let mut state = self.inner.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            self.inner.disable_network_locked(&mut state);
            let change = state.online_state.set(OnlineState::Offline);
            state.record_online_state(change);
        }
        self.inner.deliver_online_states().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            self.inner.disable_network_locked(&mut state);
            let change = state.online_state.set(OnlineState::Unknown);
            state.record_online_state(change);
        }
        self.inner.deliver_online_states().await;
        log::debug!("Remote store shut down");
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.lock().await.can_use_network()
    }

    /// Starts watching a target. Re-listening to a target that is already
    /// watched is a no-op.
    ///
    /// A failed send leaves the target registered: the watch stream re-sends
    /// every target when it reconnects.
    pub async fn listen(&self, target_data: TargetData) {
        let mut state = self.inner.lock().await;
        let target_id = target_data.target_id;
        if state.listen_targets.contains_key(&target_id) {
            return;
        }
        state.listen_targets.insert(target_id, target_data.clone());

        if self.inner.should_start_watch_stream(&state) {
            self.inner.start_watch_stream(&mut state);
        } else if state.watch_open {
            if let Err(err) = self.inner.send_watch_request(&mut state, target_data).await {
                log::debug!("Failed to send watch request for target {target_id}: {err}");
            }
        }
        self.deliver_online_states_later(&state);
    }

    pub async fn unlisten(&self, target_id: i32) {
        let mut state = self.inner.lock().await;
        state.listen_targets.remove(&target_id);
        if state.watch_open {
            if let Err(err) = self.inner.send_unwatch_request(&mut state, target_id).await {
                log::debug!("Failed to send unwatch request for target {target_id}: {err}");
            }
        }

        if state.listen_targets.is_empty() {
            if state.watch_open {
                self.inner.watch_stream.mark_idle();
            } else if state.can_use_network() {
                // Without targets there is nothing to tell us whether we are online.
                let change = state.online_state.set(OnlineState::Unknown);
                state.record_online_state(change);
            }
        }
        self.deliver_online_states_later(&state);
    }

    /// Moves newly queued mutation batches into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.inner.lock().await;
        self.inner.fill_write_pipeline_locked(&mut state).await
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.lock().await.write_pipeline.len()
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.lock().await.online_state.state()
    }

    /// `listen` and `unlisten` run while the syncer holds its own lock, so
    /// their online state changes reach it from a separate task.
    fn deliver_online_states_later(&self, state: &RemoteStoreState) {
        if state.pending_online_states.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        runtime::spawn_detached(async move {
            inner.deliver_online_states().await;
        });
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    serializer: JsonProtoSerializer,
    bloom_filter_enabled: bool,
    max_pending_writes: usize,
    syncer: Weak<dyn RemoteSyncer>,
    /// Serializes hand-off of queued online states to the syncer.
    online_delivery: Mutex<()>,
}

impl RemoteStoreInner {
    async fn lock(&self) -> MutexGuard<'_, RemoteStoreState> {
        self.state.lock().await
    }

    /// Hands queued online state changes to the syncer in the order they
    /// happened. Never called with the store's lock held.
    async fn deliver_online_states(&self) {
        let _turn = self.online_delivery.lock().await;
        let pending = std::mem::take(&mut self.lock().await.pending_online_states);
        if pending.is_empty() {
            return;
        }
        let Some(syncer) = self.syncer() else {
            log::debug!("Dropping {} online state changes without a syncer", pending.len());
            return;
        };
        for state in pending {
            syncer.apply_online_state_change(state).await;
        }
    }

    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.upgrade()
    }

    async fn enable_network_locked(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        if !state.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream(state) {
            self.start_watch_stream(state);
        } else {
            let change = state.online_state.set(OnlineState::Unknown);
            state.record_online_state(change);
        }
        self.fill_write_pipeline_locked(state).await
    }

    fn disable_network_locked(&self, state: &mut RemoteStoreState) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "Stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.write_handshake_complete = false;
        state.watch_aggregator = None;
        state.watch_open = false;
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.watch_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.watch_open = false;
        state.watch_aggregator = Some(WatchChangeAggregator::new(
            self.serializer.clone(),
            self.bloom_filter_enabled,
        ));
        self.watch_stream.start();
        let change = state.online_state.handle_watch_stream_start();
        state.record_online_state(change);
    }

    /// Sends `addTarget`, telling the backend how many documents we expect
    /// when the target resumes from a previous snapshot.
    async fn send_watch_request(
        &self,
        state: &mut RemoteStoreState,
        mut target_data: TargetData,
    ) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            if let Some(syncer) = self.syncer() {
                let expected = syncer.get_remote_keys_for_target(target_data.target_id).len();
                target_data = target_data.with_expected_count(Some(expected as i32));
            }
        }
        self.watch_stream.watch(&target_data).await
    }

    async fn send_unwatch_request(
        &self,
        state: &mut RemoteStoreState,
        target_id: i32,
    ) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await
    }

    /// Builds the remote event for a consistent snapshot and re-listens to
    /// targets whose existence filter did not match.
    async fn raise_watch_snapshot(
        &self,
        state: &mut RemoteStoreState,
        syncer: &dyn RemoteSyncer,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<RemoteEvent>> {
        let RemoteStoreState {
            listen_targets,
            watch_aggregator,
            ..
        } = state;
        let Some(aggregator) = watch_aggregator.as_mut() else {
            return Ok(None);
        };
        let provider = ListenTargetsProvider {
            listen_targets,
            syncer,
        };
        let event = aggregator.create_remote_event(snapshot_version, &provider);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                *target_data = target_data
                    .clone()
                    .with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = state.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Forget the resume token so the re-listen returns the full result set.
            let cleared = target_data
                .clone()
                .with_resume_token(Vec::new(), target_data.snapshot_version);
            state.listen_targets.insert(*target_id, cleared);
            self.send_unwatch_request(state, *target_id).await?;
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(state, request).await?;
        }

        Ok(Some(event))
    }

    fn can_add_to_write_pipeline(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && state.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn fill_write_pipeline_locked(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        let mut last_batch_id = state.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline(state) {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(state, batch).await;
                }
                None => {
                    if state.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream(state) {
            self.write_stream.start();
        }
        Ok(())
    }

    /// Queues `batch` and sends it right away when the handshake already
    /// flushed the pipeline. Otherwise the handshake sends it.
    async fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) {
        let send_now = state.write_handshake_complete && self.write_stream.is_open();
        let batch_id = batch.batch_id;
        let mutations = batch.mutations.clone();
        state.write_pipeline.push_back(batch);
        if send_now {
            // The batch stays queued; a reconnect sends it again.
            if let Err(err) = self.write_stream.write_mutations(&mutations).await {
                log::debug!("Failed to send batch {batch_id}: {err}");
            }
        }
    }
}

#[async_trait]
impl WatchStreamDelegate for RemoteStoreInner {
    async fn on_watch_stream_open(&self) {
        let mut state = self.lock().await;
        state.watch_open = true;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            if let Err(err) = self.send_watch_request(&mut state, target_data).await {
                log::debug!("Failed to send watch request: {err}");
                break;
            }
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };

        let mut rejected = Vec::new();
        let event = self
            .apply_watch_change(syncer.as_ref(), change, snapshot_version, &mut rejected)
            .await;
        self.deliver_online_states().await;
        let event = event?;

        for (target_id, cause) in rejected {
            log::debug!("Target {target_id} was rejected: {cause}");
            syncer.reject_listen(target_id, cause).await?;
        }
        if let Some(event) = event {
            syncer.apply_remote_event(event).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> bool {
        let restart = self.handle_watch_stream_close(error).await;
        self.deliver_online_states().await;
        restart
    }
}

impl RemoteStoreInner {
    /// Feeds one watch message to the aggregator. Returns the remote event
    /// when the message completed a consistent snapshot; targets removed
    /// with a cause are collected in `rejected`.
    async fn apply_watch_change(
        &self,
        syncer: &dyn RemoteSyncer,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
        rejected: &mut Vec<(i32, FirestoreError)>,
    ) -> FirestoreResult<Option<RemoteEvent>> {
        let mut state = self.lock().await;
        // Any message from the backend proves it is reachable.
        let online = state.online_state.set(OnlineState::Online);
        state.record_online_state(online);

        let rejection = match &change {
            WatchChange::TargetChange(target_change)
                if target_change.state == TargetChangeState::Remove =>
            {
                target_change.cause.clone()
            }
            _ => None,
        };

        if let Some(cause) = rejection {
            if let WatchChange::TargetChange(target_change) = &change {
                for target_id in &target_change.target_ids {
                    if state.listen_targets.remove(target_id).is_some() {
                        if let Some(aggregator) = state.watch_aggregator.as_mut() {
                            aggregator.remove_target(*target_id);
                        }
                        rejected.push((*target_id, cause.clone()));
                    }
                }
            }
            Ok(None)
        } else {
            {
                let RemoteStoreState {
                    listen_targets,
                    watch_aggregator,
                    ..
                } = &mut *state;
                let Some(aggregator) = watch_aggregator.as_mut() else {
                    return Ok(None);
                };
                let provider = ListenTargetsProvider {
                    listen_targets,
                    syncer,
                };
                match change {
                    WatchChange::DocumentChange(document_change) => {
                        aggregator.handle_document_change(document_change, &provider)
                    }
                    WatchChange::ExistenceFilter(filter) => {
                        aggregator.handle_existence_filter(&filter, &provider)
                    }
                    WatchChange::TargetChange(target_change) => {
                        aggregator.handle_target_change(&target_change, &provider)
                    }
                }
            }

            if !snapshot_version.is_min()
                && snapshot_version >= syncer.last_remote_snapshot_version()?
            {
                self.raise_watch_snapshot(&mut state, syncer, snapshot_version)
                    .await
            } else {
                Ok(None)
            }
        }
    }

    async fn handle_watch_stream_close(&self, error: Option<FirestoreError>) -> bool {
        let mut state = self.lock().await;
        state.watch_aggregator = None;
        state.watch_open = false;
        let restart = state.can_use_network() && !state.listen_targets.is_empty();
        match error {
            Some(error) if restart => {
                let change = state.online_state.handle_watch_stream_failure(&error);
                state.record_online_state(change);
                // The stream reconnects itself after its backoff; start a
                // fresh aggregator for the new connection.
                state.watch_aggregator = Some(WatchChangeAggregator::new(
                    self.serializer.clone(),
                    self.bloom_filter_enabled,
                ));
                let change = state.online_state.handle_watch_stream_start();
                state.record_online_state(change);
                true
            }
            _ => {
                let change = state.online_state.set(OnlineState::Unknown);
                state.record_online_state(change);
                false
            }
        }
    }
}

#[async_trait]
impl WriteStreamDelegate for RemoteStoreInner {
    async fn on_write_stream_open(&self) {
        self.lock().await.write_handshake_complete = false;
        if let Err(err) = self.write_stream.write_handshake().await {
            log::debug!("Failed to send write handshake: {err}");
        }
    }

    /// Persists the fresh stream token and sends the whole pipeline. Batches
    /// queued from here on are sent as they arrive.
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        syncer.set_last_stream_token(stream_token)?;
        let mut state = self.lock().await;
        state.write_handshake_complete = true;
        for batch in &state.write_pipeline {
            self.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        let batch = self.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            log::warn!("Received a write result without a pending batch");
            return Ok(());
        };
        let result = MutationBatchResult::from(batch, commit_version, results, stream_token)?;
        syncer.apply_successful_write(result).await?;

        let mut state = self.lock().await;
        self.fill_write_pipeline_locked(&mut state).await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> bool {
        let Some(syncer) = self.syncer() else {
            return false;
        };
        let mut rejected = None;
        {
            let mut state = self.lock().await;
            let handshake_complete = std::mem::take(&mut state.write_handshake_complete);
            let pending = !state.write_pipeline.is_empty();
            if let Some(error) = error.filter(|_| pending) {
                if handshake_complete {
                    if error.code.is_permanent_write_error() {
                        // The backend will never accept this batch; drop it so
                        // the rest of the queue can proceed.
                        if let Some(batch) = state.write_pipeline.pop_front() {
                            self.write_stream.inhibit_backoff();
                            rejected = Some((batch.batch_id, error));
                        }
                    }
                } else if error.is_permanent() {
                    log::debug!("Write stream handshake failed, clearing stream token: {error}");
                    self.write_stream.set_last_stream_token(Vec::new());
                    if let Err(err) = syncer.set_last_stream_token(Vec::new()) {
                        log::warn!("Failed to clear stream token: {err}");
                    }
                }
            }
        }

        if let Some((batch_id, error)) = rejected {
            log::debug!("Rejecting batch {batch_id}: {error}");
            if let Err(err) = syncer.reject_failed_write(batch_id, error).await {
                log::warn!("Failed to reject batch {batch_id}: {err}");
            }
            let mut state = self.lock().await;
            if let Err(err) = self.fill_write_pipeline_locked(&mut state).await {
                log::warn!("Failed to refill the write pipeline: {err}");
            }
        }

        let state = self.lock().await;
        state.can_use_network() && !state.write_pipeline.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{DatabaseId, DocumentKey, ObjectValue, ResourcePath, Timestamp};
    use crate::firestore::mutation::Mutation;
    use crate::firestore::remote::datastore::{
        InMemoryStreamingDatastore, NoopTokenProvider, ServerStream,
    };
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::settings::BackoffSettings;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        rejected_listens: StdMutex<Vec<(i32, FirestoreErrorCode)>>,
        acknowledged: StdMutex<Vec<i32>>,
        rejected_writes: StdMutex<Vec<(i32, FirestoreErrorCode)>>,
        online_states: StdMutex<Vec<OnlineState>>,
        queue: StdMutex<Vec<MutationBatch>>,
        stream_token: StdMutex<Vec<u8>>,
        /// Blocks `set_last_stream_token` for this long.
        token_delay: StdMutex<Duration>,
    }

    impl FakeSyncer {
        fn enqueue(&self, batch_id: i32, path: &str) {
            let key = DocumentKey::from_string(path).unwrap();
            self.queue.lock().unwrap().push(MutationBatch {
                batch_id,
                local_write_time: Timestamp::now(),
                base_mutations: Vec::new(),
                mutations: vec![Mutation::set(key, ObjectValue::empty())],
            });
        }

        fn remove_batch(&self, batch_id: i32) {
            self.queue.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
        }
    }

    impl RemoteSyncer for FakeSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(
            &self,
            target_id: i32,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push((target_id, error.code));
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.remove_batch(result.batch.batch_id);
            *self.stream_token.lock().unwrap() = result.stream_token.clone();
            self.acknowledged.lock().unwrap().push(result.batch.batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            batch_id: i32,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.remove_batch(batch_id);
            self.rejected_writes.lock().unwrap().push((batch_id, error.code));
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_online_state_change(&self, state: OnlineState) -> RemoteStoreFuture<'_, ()> {
            self.online_states.lock().unwrap().push(state);
            box_remote_store_future(async {})
        }

        fn get_remote_keys_for_target(&self, _target_id: i32) -> DocumentKeySet {
            DocumentKeySet::new()
        }

        fn next_mutation_batch(
            &self,
            after_batch_id: Option<i32>,
        ) -> FirestoreResult<Option<MutationBatch>> {
            let after = after_batch_id.unwrap_or(-1);
            Ok(self
                .queue
                .lock()
                .unwrap()
                .iter()
                .find(|batch| batch.batch_id > after)
                .cloned())
        }

        fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
            Ok(self.stream_token.lock().unwrap().clone())
        }

        fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
            let delay = *self.token_delay.lock().unwrap();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            *self.stream_token.lock().unwrap() = token;
            Ok(())
        }

        fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
            Ok(SnapshotVersion::min())
        }
    }

    fn fast_settings() -> RemoteStoreSettings {
        RemoteStoreSettings {
            backoff: BackoffSettings {
                initial_delay: Duration::from_millis(5),
                backoff_factor: 1.5,
                max_delay: Duration::from_millis(20),
                jitter_factor: 0.0,
            },
            ..RemoteStoreSettings::default()
        }
    }

    fn remote_store(
        datastore: &InMemoryStreamingDatastore,
        syncer: &Arc<FakeSyncer>,
    ) -> RemoteStore {
        remote_store_with(datastore, syncer, fast_settings())
    }

    fn remote_store_with(
        datastore: &InMemoryStreamingDatastore,
        syncer: &Arc<FakeSyncer>,
        settings: RemoteStoreSettings,
    ) -> RemoteStore {
        let syncer: Arc<dyn RemoteSyncer> = syncer.clone();
        RemoteStore::new(
            Arc::new(datastore.clone()),
            Arc::new(NoopTokenProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
            settings,
            true,
            Arc::downgrade(&syncer),
        )
    }

    fn written_path(request: &serde_json::Value) -> String {
        let name = request["writes"][0]["update"]["name"].as_str().unwrap();
        name.rsplit("/documents/").next().unwrap().to_string()
    }

    async fn acknowledge_write(server: &ServerStream, token: &str) {
        server
            .send_json(&json!({
                "streamToken": token,
                "commitTime": "2024-01-01T00:00:05Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:05Z" }]
            }))
            .await
            .unwrap();
    }

    fn target_data(target_id: i32) -> TargetData {
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn handshake(server: &ServerStream, token: &str) {
        let request = server.recv_json().await.expect("handshake");
        assert!(request.get("database").is_some());
        server.send_json(&json!({ "streamToken": token })).await.unwrap();
    }

    #[tokio::test]
    async fn listen_sends_targets_and_raises_snapshots() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        let store = remote_store(&datastore, &syncer);

        store.listen(target_data(2)).await;
        let server = datastore.accept_listen().await.expect("watch stream");
        let add = server.recv_json().await.unwrap();
        assert_eq!(add["addTarget"]["targetId"], 2);

        server
            .send_json(&json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }))
            .await
            .unwrap();
        server
            .send_json(&json!({ "documentChange": {
                "document": {
                    "name": "projects/p/databases/(default)/documents/rooms/eros",
                    "fields": { "likes": { "integerValue": "12" } },
                    "updateTime": "2024-01-01T00:00:00Z"
                },
                "targetIds": [2]
            }}))
            .await
            .unwrap();
        server
            .send_json(&json!({ "targetChange": {
                "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "dG9r"
            }}))
            .await
            .unwrap();
        server
            .send_json(&json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }))
            .await
            .unwrap();

        wait_until(|| syncer.events.lock().unwrap().len() == 1).await;
        let event = syncer.events.lock().unwrap()[0].clone();
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert_eq!(event.document_updates.len(), 1);
        wait_until(|| {
            syncer
                .online_states
                .lock()
                .unwrap()
                .contains(&OnlineState::Online)
        })
        .await;

        store.unlisten(2).await;
        let remove = server.recv_json().await.unwrap();
        assert_eq!(remove["removeTarget"], 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn resumed_target_reports_expected_count() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        let store = remote_store(&datastore, &syncer);

        let resumed = target_data(6).with_resume_token(
            b"tok".to_vec(),
            SnapshotVersion::new(Timestamp::new(1_704_067_200, 0)),
        );
        store.listen(resumed).await;
        let server = datastore.accept_listen().await.unwrap();
        let add = server.recv_json().await.unwrap();
        assert_eq!(add["addTarget"]["targetId"], 6);
        assert_eq!(add["addTarget"]["resumeToken"], "dG9r");
        assert_eq!(add["addTarget"]["expectedCount"], 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn removed_target_with_cause_rejects_listen() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        let store = remote_store(&datastore, &syncer);

        store.listen(target_data(4)).await;
        let server = datastore.accept_listen().await.unwrap();
        server.recv_json().await.unwrap();
        server
            .send_json(&json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }}))
            .await
            .unwrap();

        wait_until(|| !syncer.rejected_listens.lock().unwrap().is_empty()).await;
        assert_eq!(
            syncer.rejected_listens.lock().unwrap()[0],
            (4, FirestoreErrorCode::PermissionDenied)
        );
        store.shutdown().await;
    }

    #[tokio::test]
    async fn writes_flow_in_order_and_are_acknowledged() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        syncer.enqueue(1, "rooms/a");
        syncer.enqueue(2, "rooms/b");
        let store = remote_store(&datastore, &syncer);

        store.fill_write_pipeline().await.unwrap();
        // One batch in flight at a time.
        assert_eq!(store.pending_write_count().await, 1);
        let server = datastore.accept_write().await.expect("write stream");
        handshake(&server, "dG9rMQ==").await;

        let first = server.recv_json().await.unwrap();
        assert_eq!(first["streamToken"], "dG9rMQ==");
        assert_eq!(written_path(&first), "rooms/a");
        assert!(server
            .recv_json_within(Duration::from_millis(50))
            .await
            .is_none());

        acknowledge_write(&server, "dG9rMg==").await;
        let second = server.recv_json().await.unwrap();
        assert_eq!(second["streamToken"], "dG9rMg==");
        assert_eq!(written_path(&second), "rooms/b");
        acknowledge_write(&server, "dG9rMw==").await;
        wait_until(|| syncer.acknowledged.lock().unwrap().len() == 2).await;
        assert_eq!(syncer.acknowledged.lock().unwrap().as_slice(), &[1, 2]);
        assert_eq!(syncer.last_stream_token().unwrap(), b"tok3".to_vec());
        assert_eq!(store.pending_write_count().await, 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_head_batch_and_continues() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        syncer.enqueue(1, "rooms/a");
        syncer.enqueue(2, "rooms/b");
        let store = remote_store(&datastore, &syncer);
        store.fill_write_pipeline().await.unwrap();

        let server = datastore.accept_write().await.unwrap();
        handshake(&server, "dG9r").await;
        server.recv_json().await.unwrap();
        server.fail(permission_denied("rules")).await;

        wait_until(|| !syncer.rejected_writes.lock().unwrap().is_empty()).await;
        assert_eq!(
            syncer.rejected_writes.lock().unwrap()[0],
            (1, FirestoreErrorCode::PermissionDenied)
        );

        let retry = datastore.accept_write().await.expect("write stream reopened");
        handshake(&retry, "dG9y").await;
        let resent = retry.recv_json().await.unwrap();
        assert_eq!(written_path(&resent), "rooms/b");
        store.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_queued_during_handshake_is_sent_once_in_order() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        syncer.enqueue(1, "rooms/a");
        let store = remote_store_with(
            &datastore,
            &syncer,
            RemoteStoreSettings {
                max_pending_writes: 2,
                ..fast_settings()
            },
        );
        store.fill_write_pipeline().await.unwrap();
        let server = datastore.accept_write().await.unwrap();

        // Stall the handshake after the stream has seen the token but before
        // the pipeline is flushed, and queue another batch in that gap.
        *syncer.token_delay.lock().unwrap() = Duration::from_millis(200);
        handshake(&server, "dG9r").await;
        wait_until(|| store.inner.write_stream.handshake_complete()).await;
        syncer.enqueue(2, "rooms/b");
        store.fill_write_pipeline().await.unwrap();
        assert_eq!(store.pending_write_count().await, 2);

        let mut sent = Vec::new();
        while let Some(request) = server.recv_json_within(Duration::from_millis(400)).await {
            sent.push(written_path(&request));
        }
        assert_eq!(sent, vec!["rooms/a".to_string(), "rooms/b".to_string()]);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn failed_send_keeps_batch_for_next_connection() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        syncer.enqueue(1, "rooms/a");
        let store = remote_store(&datastore, &syncer);
        store.fill_write_pipeline().await.unwrap();

        let server = datastore.accept_write().await.unwrap();
        handshake(&server, "dG9r").await;
        server.recv_json().await.unwrap();
        acknowledge_write(&server, "dG9yMg==").await;
        wait_until(|| syncer.acknowledged.lock().unwrap().len() == 1).await;

        drop(server);
        syncer.enqueue(2, "rooms/b");
        store.fill_write_pipeline().await.unwrap();
        assert_eq!(store.pending_write_count().await, 1);

        let retry = datastore.accept_write().await.expect("write stream reopened");
        handshake(&retry, "dG9yMw==").await;
        let resent = retry.recv_json().await.unwrap();
        assert_eq!(written_path(&resent), "rooms/b");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn disable_network_reports_offline_and_clears_pipeline() {
        let datastore = InMemoryStreamingDatastore::new();
        let syncer = Arc::new(FakeSyncer::default());
        syncer.enqueue(1, "rooms/a");
        let store = remote_store(&datastore, &syncer);
        store.fill_write_pipeline().await.unwrap();
        let _server = datastore.accept_write().await.unwrap();

        store.disable_network().await.unwrap();
        assert_eq!(
            syncer.online_states.lock().unwrap().last(),
            Some(&OnlineState::Offline)
        );
        assert!(!store.can_use_network().await);
        assert_eq!(store.pending_write_count().await, 0);
        assert_eq!(store.online_state().await, OnlineState::Offline);
        store.fill_write_pipeline().await.unwrap();
        assert_eq!(store.pending_write_count().await, 0);

        store.enable_network().await.unwrap();
        assert_eq!(store.pending_write_count().await, 1);
        assert!(datastore.accept_write().await.is_some());
        store.shutdown().await;
    }
}
