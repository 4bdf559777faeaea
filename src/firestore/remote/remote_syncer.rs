use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::OnlineState;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKeySet, SnapshotVersion};
use crate::firestore::mutation::{MutationBatch, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Bridge between the remote store and the sync engine.
///
/// The asynchronous callbacks are never invoked while the remote store holds
/// its own state lock, so implementations may call back into it.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot delivered by the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend removed a target with an error.
    fn reject_listen(
        &self,
        target_id: i32,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected a batch permanently.
    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_online_state_change(&self, state: OnlineState) -> RemoteStoreFuture<'_, ()>;

    /// Keys the local cache believes belong to a target as of the last snapshot.
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet;

    fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>>;

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()>;

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion>;
}
