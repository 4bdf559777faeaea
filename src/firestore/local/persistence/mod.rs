//! Transactional table storage shared by every local store.
//!
//! Rows are JSON documents stored under string keys. Numeric ids inside keys
//! are zero padded so prefix scans come back in numeric order.

mod durable;
mod memory;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::firestore::error::{data_loss, internal_error, FirestoreResult};
use crate::firestore::settings::PersistenceSettings;

pub use durable::DurablePersistence;
pub use memory::MemoryPersistence;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    RemoteDocuments,
    Mutations,
    MutationQueueMeta,
    Targets,
    TargetDocuments,
    TargetGlobals,
    DocumentOverlays,
    CollectionParents,
    IndexEntries,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::RemoteDocuments,
        Table::Mutations,
        Table::MutationQueueMeta,
        Table::Targets,
        Table::TargetDocuments,
        Table::TargetGlobals,
        Table::DocumentOverlays,
        Table::CollectionParents,
        Table::IndexEntries,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::RemoteDocuments => "remote_documents",
            Table::Mutations => "mutations",
            Table::MutationQueueMeta => "mutation_queue_meta",
            Table::Targets => "targets",
            Table::TargetDocuments => "target_documents",
            Table::TargetGlobals => "target_globals",
            Table::DocumentOverlays => "document_overlays",
            Table::CollectionParents => "collection_parents",
            Table::IndexEntries => "index_entries",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// One all-or-nothing unit of work. Dropping a transaction without calling
/// [`commit`](PersistenceTransaction::commit) discards its writes.
pub trait PersistenceTransaction {
    fn mode(&self) -> TransactionMode;

    fn get(&self, table: Table, key: &str) -> FirestoreResult<Option<Vec<u8>>>;

    fn put(&mut self, table: Table, key: &str, value: Vec<u8>) -> FirestoreResult<()>;

    fn delete(&mut self, table: Table, key: &str) -> FirestoreResult<()>;

    /// Rows whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, table: Table, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>>;

    fn commit(self: Box<Self>) -> FirestoreResult<()>;
}

pub trait Persistence: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin(
        &self,
        action: &str,
        mode: TransactionMode,
    ) -> FirestoreResult<Box<dyn PersistenceTransaction + '_>>;
}

/// Runs `work` inside a transaction, committing only when it succeeds.
pub fn run_transaction<T, F>(
    persistence: &dyn Persistence,
    action: &str,
    mode: TransactionMode,
    work: F,
) -> FirestoreResult<T>
where
    F: FnOnce(&mut dyn PersistenceTransaction) -> FirestoreResult<T>,
{
    let mut txn = persistence.begin(action, mode)?;
    match work(txn.as_mut()) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(err) => {
            log::debug!("transaction '{action}' aborted: {err}");
            Err(err)
        }
    }
}

/// Opens the configured persistence. A durable store that cannot be opened
/// leaves the session running on memory persistence.
pub fn open_persistence(settings: &PersistenceSettings) -> Arc<dyn Persistence> {
    match settings {
        PersistenceSettings::Memory => Arc::new(MemoryPersistence::new()),
        PersistenceSettings::Durable { path } => match DurablePersistence::open(path) {
            Ok(persistence) => Arc::new(persistence),
            Err(err) => {
                log::error!(
                    "failed to open durable persistence at {}, continuing in memory: {err}",
                    path.display()
                );
                Arc::new(MemoryPersistence::new())
            }
        },
    }
}

pub(crate) fn ensure_writable(mode: TransactionMode, table: Table) -> FirestoreResult<()> {
    match mode {
        TransactionMode::ReadWrite => Ok(()),
        TransactionMode::ReadOnly => Err(internal_error(format!(
            "write to '{}' inside a read-only transaction",
            table.name()
        ))),
    }
}

pub fn get_json<T: DeserializeOwned>(
    txn: &dyn PersistenceTransaction,
    table: Table,
    key: &str,
) -> FirestoreResult<Option<T>> {
    txn.get(table, key)?
        .map(|bytes| decode_row(table, key, &bytes))
        .transpose()
}

pub fn put_json<T: Serialize>(
    txn: &mut dyn PersistenceTransaction,
    table: Table,
    key: &str,
    value: &T,
) -> FirestoreResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        internal_error(format!("failed to encode row '{key}' in {}: {err}", table.name()))
    })?;
    txn.put(table, key, bytes)
}

pub fn scan_json<T: DeserializeOwned>(
    txn: &dyn PersistenceTransaction,
    table: Table,
    prefix: &str,
) -> FirestoreResult<Vec<(String, T)>> {
    txn.scan_prefix(table, prefix)?
        .into_iter()
        .map(|(key, bytes)| {
            let row = decode_row(table, &key, &bytes)?;
            Ok((key, row))
        })
        .collect()
}

fn decode_row<T: DeserializeOwned>(table: Table, key: &str, bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes).map_err(|err| {
        data_loss(format!("corrupt row '{key}' in {}: {err}", table.name()))
    })
}

/// Zero padded id so lexicographic order matches numeric order.
pub fn encode_id(id: i32) -> String {
    format!("{id:010}")
}
