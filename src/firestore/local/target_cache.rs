use serde::{Deserialize, Serialize};

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{
    encode_id, get_json, put_json, scan_json, PersistenceTransaction, Table,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};

const GLOBALS_KEY: &str = "globals";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TargetGlobals {
    highest_target_id: i32,
    highest_listen_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
    target_count: u64,
}

/// Persisted targets and the documents the backend reported for each.
#[derive(Clone, Debug, Default)]
pub struct TargetCache;

fn membership_key(target_id: i32, key: &DocumentKey) -> String {
    format!("{}/{}", encode_id(target_id), key.path().canonical_string())
}

impl TargetCache {
    fn globals(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<TargetGlobals> {
        Ok(get_json(txn, Table::TargetGlobals, GLOBALS_KEY)?.unwrap_or_default())
    }

    fn save_globals(
        &self,
        txn: &mut dyn PersistenceTransaction,
        globals: &TargetGlobals,
    ) -> FirestoreResult<()> {
        put_json(txn, Table::TargetGlobals, GLOBALS_KEY, globals)
    }

    /// Next unused even target id.
    pub fn allocate_target_id(&self, txn: &mut dyn PersistenceTransaction) -> FirestoreResult<i32> {
        let mut globals = self.globals(txn)?;
        let target_id =
            TargetIdGenerator::for_target_cache_after(globals.highest_target_id).next_id();
        globals.highest_target_id = target_id;
        self.save_globals(txn, &globals)?;
        Ok(target_id)
    }

    pub fn next_sequence_number(
        &self,
        txn: &mut dyn PersistenceTransaction,
    ) -> FirestoreResult<i64> {
        let mut globals = self.globals(txn)?;
        globals.highest_listen_sequence_number += 1;
        self.save_globals(txn, &globals)?;
        Ok(globals.highest_listen_sequence_number)
    }

    pub fn add_target_data(
        &self,
        txn: &mut dyn PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        put_json(txn, Table::Targets, &encode_id(target_data.target_id), target_data)?;
        let mut globals = self.globals(txn)?;
        globals.target_count += 1;
        globals.highest_target_id = globals.highest_target_id.max(target_data.target_id);
        globals.highest_listen_sequence_number = globals
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        self.save_globals(txn, &globals)
    }

    pub fn update_target_data(
        &self,
        txn: &mut dyn PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        put_json(txn, Table::Targets, &encode_id(target_data.target_id), target_data)
    }

    /// Removes the target and its document membership rows.
    pub fn remove_target_data(
        &self,
        txn: &mut dyn PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        let row = encode_id(target_data.target_id);
        if txn.get(Table::Targets, &row)?.is_some() {
            txn.delete(Table::Targets, &row)?;
            let mut globals = self.globals(txn)?;
            globals.target_count = globals.target_count.saturating_sub(1);
            self.save_globals(txn, &globals)?;
        }
        Ok(())
    }

    pub fn get_target_data(
        &self,
        txn: &dyn PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        Ok(scan_json::<TargetData>(txn, Table::Targets, "")?
            .into_iter()
            .map(|(_, data)| data)
            .find(|data| data.target.canonical_id() == canonical_id))
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &dyn PersistenceTransaction,
        target_id: i32,
    ) -> FirestoreResult<Option<TargetData>> {
        get_json(txn, Table::Targets, &encode_id(target_id))
    }

    pub fn target_count(&self, txn: &dyn PersistenceTransaction) -> FirestoreResult<u64> {
        Ok(self.globals(txn)?.target_count)
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut dyn PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.put(Table::TargetDocuments, &membership_key(target_id, key), Vec::new())?;
        }
        Ok(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut dyn PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(Table::TargetDocuments, &membership_key(target_id, key))?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut dyn PersistenceTransaction,
        target_id: i32,
    ) -> FirestoreResult<()> {
        let prefix = format!("{}/", encode_id(target_id));
        for (row, _) in txn.scan_prefix(Table::TargetDocuments, &prefix)? {
            txn.delete(Table::TargetDocuments, &row)?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &dyn PersistenceTransaction,
        target_id: i32,
    ) -> FirestoreResult<DocumentKeySet> {
        let prefix = format!("{}/", encode_id(target_id));
        txn.scan_prefix(Table::TargetDocuments, &prefix)?
            .into_iter()
            .map(|(row, _)| DocumentKey::from_string(&row[prefix.len()..]))
            .collect()
    }

    /// Whether any target still references `key`.
    pub fn contains_key(
        &self,
        txn: &dyn PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<bool> {
        let suffix = format!("/{}", key.path().canonical_string());
        Ok(txn
            .scan_prefix(Table::TargetDocuments, "")?
            .iter()
            .any(|(row, _)| row.ends_with(&suffix) && row.len() == suffix.len() + 10))
    }

    pub fn last_remote_snapshot_version(
        &self,
        txn: &dyn PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(self.globals(txn)?.last_remote_snapshot_version)
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut dyn PersistenceTransaction,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut globals = self.globals(txn)?;
        globals.last_remote_snapshot_version = version;
        self.save_globals(txn, &globals)
    }
}
