use std::collections::BTreeMap;

use crate::firestore::api::client::FirestoreClient;
use crate::firestore::api::operations::{self, SetOptions};
use crate::firestore::error::{resource_exhausted, FirestoreResult};
use crate::firestore::model::DocumentKey;
use crate::firestore::mutation::Mutation;
use crate::firestore::value::FirestoreValue;

const MAX_BATCH_WRITES: usize = 500;

/// Collects writes and applies them as one atomic batch.
///
/// The batch is visible to local listeners as soon as it is committed and
/// `commit` resolves once the server acknowledges it.
pub struct WriteBatch {
    client: FirestoreClient,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub(crate) fn new(client: FirestoreClient) -> Self {
        Self {
            client,
            mutations: Vec::new(),
        }
    }

    /// Replaces the document at `key` with `data`.
    pub fn set(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.set_with_options(key, data, &SetOptions::default())
    }

    /// Merges `data` into the document at `key`, creating it if needed.
    pub fn set_merge(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.set_with_options(key, data, &SetOptions::merge_all())
    }

    pub fn set_with_options(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, FirestoreValue>,
        options: &SetOptions,
    ) -> FirestoreResult<&mut Self> {
        self.ensure_writable()?;
        let mutation = operations::parse_set_data(key.clone(), data, options)?;
        self.mutations.push(mutation);
        Ok(self)
    }

    /// Updates fields of an existing document. Keys are dot-separated field
    /// paths. Fails on the server when the document does not exist.
    pub fn update(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.ensure_writable()?;
        let mutation = operations::parse_update_data(key.clone(), data)?;
        self.mutations.push(mutation);
        Ok(self)
    }

    pub fn delete(&mut self, key: &DocumentKey) -> FirestoreResult<&mut Self> {
        self.ensure_writable()?;
        self.mutations.push(Mutation::delete(key.clone()));
        Ok(self)
    }

    /// Adds an already built mutation, e.g. one with a custom precondition.
    pub fn mutation(&mut self, mutation: Mutation) -> FirestoreResult<&mut Self> {
        self.ensure_writable()?;
        self.mutations.push(mutation);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies all queued writes and waits for the server acknowledgement.
    pub async fn commit(self) -> FirestoreResult<()> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        self.client.apply_batch(self.mutations).await
    }

    fn ensure_writable(&self) -> FirestoreResult<()> {
        if self.mutations.len() >= MAX_BATCH_WRITES {
            return Err(resource_exhausted(format!(
                "A write batch cannot contain more than {MAX_BATCH_WRITES} writes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::InMemoryStreamingDatastore;
    use crate::firestore::settings::FirestoreSettings;
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn builder_collects_mutations_in_order() {
        let datastore = InMemoryStreamingDatastore::new();
        let client =
            FirestoreClient::new(FirestoreSettings::default(), Arc::new(datastore)).unwrap();
        let mut batch = client.write_batch();
        batch
            .set(
                &key("rooms/a"),
                BTreeMap::from([("likes".to_string(), FirestoreValue::from_integer(1))]),
            )
            .unwrap()
            .update(
                &key("rooms/b"),
                BTreeMap::from([("likes".to_string(), FirestoreValue::from_integer(2))]),
            )
            .unwrap()
            .delete(&key("rooms/c"))
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.mutations[0], Mutation::Set { .. }));
        assert!(matches!(batch.mutations[1], Mutation::Patch { .. }));
        assert!(matches!(batch.mutations[2], Mutation::Delete { .. }));
        client.terminate().await;
    }

    #[tokio::test]
    async fn empty_batch_commits_without_writing() {
        let datastore = InMemoryStreamingDatastore::new();
        let client =
            FirestoreClient::new(FirestoreSettings::default(), Arc::new(datastore.clone()))
                .unwrap();
        client.write_batch().commit().await.unwrap();
        assert_eq!(datastore.write_streams_opened(), 0);
        client.terminate().await;
    }

    #[tokio::test]
    async fn batch_size_is_bounded() {
        let datastore = InMemoryStreamingDatastore::new();
        let client =
            FirestoreClient::new(FirestoreSettings::default(), Arc::new(datastore)).unwrap();
        let mut batch = client.write_batch();
        for index in 0..MAX_BATCH_WRITES {
            batch.delete(&key(&format!("rooms/{index}"))).unwrap();
        }
        let err = batch.delete(&key("rooms/overflow")).err().unwrap();
        assert_eq!(err.code_str(), "firestore/resource-exhausted");
        client.terminate().await;
    }
}
