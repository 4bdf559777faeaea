use std::fmt::Display;
use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

use crate::firestore::error::{persistence_unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::persistence::{
    ensure_writable, Persistence, PersistenceTransaction, Table, TransactionMode,
};

type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn definition(table: Table) -> RowTable {
    TableDefinition::new(table.name())
}

fn storage_error(err: impl Display) -> FirestoreError {
    persistence_unavailable(err.to_string())
}

/// Persistence backed by a redb database file, one redb table per logical table.
pub struct DurablePersistence {
    db: Database,
}

impl DurablePersistence {
    pub fn open(path: &Path) -> FirestoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let db = Database::create(path).map_err(storage_error)?;

        let txn = db.begin_write().map_err(storage_error)?;
        for table in Table::ALL {
            txn.open_table(definition(table)).map_err(storage_error)?;
        }
        txn.commit().map_err(storage_error)?;

        log::debug!("opened durable persistence at {}", path.display());
        Ok(Self { db })
    }
}

impl Persistence for DurablePersistence {
    fn name(&self) -> &'static str {
        "durable"
    }

    fn begin(
        &self,
        action: &str,
        mode: TransactionMode,
    ) -> FirestoreResult<Box<dyn PersistenceTransaction + '_>> {
        let txn = match mode {
            TransactionMode::ReadOnly => RedbTransaction::Read(
                self.db
                    .begin_read()
                    .map_err(|err| storage_error(format!("{action}: {err}")))?,
            ),
            TransactionMode::ReadWrite => RedbTransaction::Write(
                self.db
                    .begin_write()
                    .map_err(|err| storage_error(format!("{action}: {err}")))?,
            ),
        };
        Ok(Box::new(DurableTransaction { txn }))
    }
}

enum RedbTransaction {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

struct DurableTransaction {
    txn: RedbTransaction,
}

fn get_row<T>(table: &T, key: &str) -> FirestoreResult<Option<Vec<u8>>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(key)
        .map_err(storage_error)?
        .map(|value| value.value().to_vec()))
}

fn scan_rows<T>(table: &T, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.range(prefix..).map_err(storage_error)? {
        let (key, value) = entry.map_err(storage_error)?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        rows.push((key.to_string(), value.value().to_vec()));
    }
    Ok(rows)
}

impl PersistenceTransaction for DurableTransaction {
    fn mode(&self) -> TransactionMode {
        match self.txn {
            RedbTransaction::Read(_) => TransactionMode::ReadOnly,
            RedbTransaction::Write(_) => TransactionMode::ReadWrite,
        }
    }

    fn get(&self, table: Table, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        match &self.txn {
            RedbTransaction::Read(txn) => {
                get_row(&txn.open_table(definition(table)).map_err(storage_error)?, key)
            }
            RedbTransaction::Write(txn) => {
                get_row(&txn.open_table(definition(table)).map_err(storage_error)?, key)
            }
        }
    }

    fn put(&mut self, table: Table, key: &str, value: Vec<u8>) -> FirestoreResult<()> {
        ensure_writable(self.mode(), table)?;
        if let RedbTransaction::Write(txn) = &self.txn {
            let mut rows = txn.open_table(definition(table)).map_err(storage_error)?;
            rows.insert(key, value.as_slice()).map_err(storage_error)?;
        }
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &str) -> FirestoreResult<()> {
        ensure_writable(self.mode(), table)?;
        if let RedbTransaction::Write(txn) = &self.txn {
            let mut rows = txn.open_table(definition(table)).map_err(storage_error)?;
            rows.remove(key).map_err(storage_error)?;
        }
        Ok(())
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        match &self.txn {
            RedbTransaction::Read(txn) => {
                scan_rows(&txn.open_table(definition(table)).map_err(storage_error)?, prefix)
            }
            RedbTransaction::Write(txn) => {
                scan_rows(&txn.open_table(definition(table)).map_err(storage_error)?, prefix)
            }
        }
    }

    fn commit(self: Box<Self>) -> FirestoreResult<()> {
        match self.txn {
            RedbTransaction::Read(_) => Ok(()),
            RedbTransaction::Write(txn) => txn.commit().map_err(storage_error),
        }
    }
}
