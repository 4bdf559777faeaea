use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::{
    encode_id, get_json, put_json, scan_json, PersistenceTransaction, Table,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet, Timestamp};
use crate::firestore::mutation::{Mutation, MutationBatch, BATCH_ID_UNKNOWN};

const META_KEY: &str = "meta";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct QueueMetadata {
    last_acknowledged_batch_id: i32,
    next_batch_id: i32,
    #[serde(with = "crate::firestore::value::bytes_value::base64_bytes")]
    last_stream_token: Vec<u8>,
}

impl Default for QueueMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            next_batch_id: 1,
            last_stream_token: Vec::new(),
        }
    }
}

/// FIFO queue of locally written batches that the backend has not yet acknowledged.
#[derive(Clone, Debug, Default)]
pub struct MutationQueue;

impl MutationQueue {
    fn metadata(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<QueueMetadata> {
        Ok(get_json(txn, Table::MutationQueueMeta, META_KEY)?.unwrap_or_default())
    }

    fn batches(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(scan_json(txn, Table::Mutations, "")?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    pub fn is_empty(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(txn.scan_prefix(Table::Mutations, "")?.is_empty())
    }

    /// Queues a new batch under the next batch id.
    pub fn add_mutation_batch(
        &self,
        txn: &mut dyn PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut meta = self.metadata(txn)?;
        let batch = MutationBatch::new(meta.next_batch_id, local_write_time, base_mutations, mutations);
        meta.next_batch_id += 1;
        put_json(txn, Table::Mutations, &encode_id(batch.batch_id), &batch)?;
        put_json(txn, Table::MutationQueueMeta, META_KEY, &meta)?;
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &dyn PersistenceTransaction,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        get_json(txn, Table::Mutations, &encode_id(batch_id))
    }

    /// First queued batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(
        &self,
        txn: &dyn PersistenceTransaction,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .batches(txn)?
            .into_iter()
            .find(|batch| batch.batch_id > batch_id))
    }

    pub fn highest_unacknowledged_batch_id(
        &self,
        txn: &dyn PersistenceTransaction,
    ) -> FirestoreResult<i32> {
        Ok(self
            .batches(txn)?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn all_mutation_batches(
        &self,
        txn: &dyn PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.batches(txn)
    }

    pub fn all_mutation_batches_affecting_keys(
        &self,
        txn: &dyn PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .batches(txn)?
            .into_iter()
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .collect())
    }

    pub fn all_mutation_batches_affecting_key(
        &self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .batches(txn)?
            .into_iter()
            .filter(|batch| batch.affects(key))
            .collect())
    }

    /// Batches touching a document directly inside the query's collection.
    pub fn all_mutation_batches_affecting_query(
        &self,
        txn: &dyn PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .batches(txn)?
            .into_iter()
            .filter(|batch| {
                batch
                    .mutations
                    .iter()
                    .any(|m| query.path().is_immediate_parent_of(m.key().path()))
            })
            .collect())
    }

    /// Records the acknowledgement of the head batch along with the stream token.
    pub fn acknowledge_batch(
        &self,
        txn: &mut dyn PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut meta = self.metadata(txn)?;
        if batch.batch_id <= meta.last_acknowledged_batch_id {
            return Err(internal_error(format!(
                "batch {} acknowledged after {}",
                batch.batch_id, meta.last_acknowledged_batch_id
            )));
        }
        meta.last_acknowledged_batch_id = batch.batch_id;
        meta.last_stream_token = stream_token;
        put_json(txn, Table::MutationQueueMeta, META_KEY, &meta)
    }

    pub fn remove_mutation_batch(
        &self,
        txn: &mut dyn PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let key = encode_id(batch.batch_id);
        if txn.get(Table::Mutations, &key)?.is_none() {
            return Err(internal_error(format!(
                "batch {} is not in the mutation queue",
                batch.batch_id
            )));
        }
        txn.delete(Table::Mutations, &key)
    }

    pub fn last_stream_token(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut dyn PersistenceTransaction,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut meta = self.metadata(txn)?;
        meta.last_stream_token = stream_token;
        put_json(txn, Table::MutationQueueMeta, META_KEY, &meta)
    }
}
