use std::collections::BTreeMap;
use std::sync::{Mutex as StdMutex, MutexGuard};

use crate::firestore::error::{persistence_unavailable, FirestoreResult};
use crate::firestore::local::persistence::{
    ensure_writable, Persistence, PersistenceTransaction, Table, TransactionMode,
};

type Tables = BTreeMap<Table, BTreeMap<String, Vec<u8>>>;

/// Process-lifetime persistence. Transactions are serialized by holding the
/// table lock for their whole duration; writes are staged and applied on commit.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: StdMutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(
        &self,
        action: &str,
        mode: TransactionMode,
    ) -> FirestoreResult<Box<dyn PersistenceTransaction + '_>> {
        let tables = self.tables.lock().map_err(|_| {
            persistence_unavailable(format!("memory tables poisoned while starting '{action}'"))
        })?;
        Ok(Box::new(MemoryTransaction {
            tables,
            staged: BTreeMap::new(),
            mode,
        }))
    }
}

struct MemoryTransaction<'a> {
    tables: MutexGuard<'a, Tables>,
    staged: BTreeMap<(Table, String), Option<Vec<u8>>>,
    mode: TransactionMode,
}

impl PersistenceTransaction for MemoryTransaction<'_> {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn get(&self, table: Table, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(table, key.to_string())) {
            return Ok(staged.clone());
        }
        Ok(self
            .tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&mut self, table: Table, key: &str, value: Vec<u8>) -> FirestoreResult<()> {
        ensure_writable(self.mode, table)?;
        self.staged.insert((table, key.to_string()), Some(value));
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &str) -> FirestoreResult<()> {
        ensure_writable(self.mode, table)?;
        self.staged.insert((table, key.to_string()), None);
        Ok(())
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        let mut rows: BTreeMap<String, Vec<u8>> = self
            .tables
            .get(&table)
            .map(|rows| {
                rows.range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let staged = self
            .staged
            .range((table, prefix.to_string())..)
            .take_while(|((staged_table, key), _)| *staged_table == table && key.starts_with(prefix));
        for ((_, key), value) in staged {
            match value {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> FirestoreResult<()> {
        let MemoryTransaction {
            mut tables, staged, ..
        } = *self;
        for ((table, key), value) in staged {
            let rows = tables.entry(table).or_default();
            match value {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}
