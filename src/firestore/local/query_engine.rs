use std::sync::Arc;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::{QueryContext, RemoteScan};
use crate::firestore::model::{DocumentKeySet, DocumentMap, DocumentSet, SnapshotVersion};
use crate::firestore::settings::QueryEngineSettings;

/// Which strategy produced a query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    PreviousResults,
    Index,
    FullScan,
}

/// Picks the cheapest way to answer a query from the local cache.
///
/// The previous result set is reused when the target was limbo free at a
/// known version, then a configured field index is tried, and a full
/// collection scan is the fallback.
#[derive(Debug)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
    index_manager: Arc<IndexManager>,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings, index_manager: Arc<IndexManager>) -> Self {
        Self {
            settings,
            index_manager,
        }
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut dyn PersistenceTransaction,
        view: &mut LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<(DocumentMap, QueryStrategy)> {
        if let Some(results) = self.perform_query_using_remote_keys(
            txn,
            view,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        )? {
            return Ok((results, QueryStrategy::PreviousResults));
        }
        if let Some(results) = self.perform_query_using_index(txn, view, query)? {
            return Ok((results, QueryStrategy::Index));
        }
        let results = self.execute_full_collection_scan(txn, view, query)?;
        Ok((results, QueryStrategy::FullScan))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut dyn PersistenceTransaction,
        view: &mut LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }
        let documents = view.get_documents(txn, remote_keys)?;
        let previous = apply_query(query, &documents);
        if needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }
        log::debug!(
            "re-using previous result from {last_limbo_free_snapshot_version} to execute query {}",
            query.canonical_id()
        );
        let mut results = view.get_documents_matching_query(
            txn,
            query,
            RemoteScan::ChangedSince(last_limbo_free_snapshot_version),
            &mut QueryContext::default(),
        )?;
        for document in previous.iter() {
            results.insert(document.key().clone(), document.clone());
        }
        Ok(Some(results))
    }

    fn perform_query_using_index(
        &self,
        txn: &mut dyn PersistenceTransaction,
        view: &mut LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<Option<DocumentMap>> {
        let Some(plan) = self.index_manager.plan(query)? else {
            return Ok(None);
        };
        let keys = self.index_manager.documents_matching(txn, &plan, query)?;
        let indexed = view.get_documents(txn, &keys)?;
        let mut results = view.get_documents_matching_query(
            txn,
            query,
            RemoteScan::Skip,
            &mut QueryContext::default(),
        )?;
        for (key, document) in indexed {
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        log::debug!(
            "answered query {} from index on {}",
            query.canonical_id(),
            plan.index.field
        );
        Ok(Some(results))
    }

    fn execute_full_collection_scan(
        &self,
        txn: &mut dyn PersistenceTransaction,
        view: &mut LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        log::debug!("using full collection scan to execute query {}", query.canonical_id());
        let mut context = QueryContext::default();
        let results = view.get_documents_matching_query(txn, query, RemoteScan::Full, &mut context)?;
        if self.settings.index_auto_creation_enabled {
            self.create_cache_indexes(txn, view, query, &context, results.len())?;
        }
        Ok(results)
    }

    /// Adds an index when a scan read many more documents than it returned.
    fn create_cache_indexes(
        &self,
        txn: &mut dyn PersistenceTransaction,
        view: &LocalDocumentsView,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        if context.documents_read < self.settings.min_collection_size_to_auto_create {
            return Ok(());
        }
        let read = context.documents_read as f64;
        let cost = self.settings.relative_index_read_cost_per_document * result_size as f64;
        if read <= cost {
            return Ok(());
        }
        let Some(index) = IndexManager::candidate_index(query) else {
            return Ok(());
        };
        if self.index_manager.add_field_index(
            txn,
            view.remote_documents().collection_parents(),
            index.clone(),
        )? {
            log::debug!(
                "auto-created index on {}.{} after reading {} documents for {} results",
                index.collection_group,
                index.field,
                context.documents_read,
                result_size
            );
        }
        Ok(())
    }
}

fn apply_query(query: &Query, documents: &DocumentMap) -> DocumentSet {
    let mut results = DocumentSet::new(query.comparator());
    for document in documents.values() {
        if query.matches(document) {
            results.add(document.clone());
        }
    }
    results
}

/// Whether the previous results of a limit query can no longer be trusted.
fn needs_refill(
    query: &Query,
    previous: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => previous.last(),
        LimitType::Last => previous.first(),
    };
    edge.is_some_and(|document| {
        document.has_pending_writes() || document.version() > limbo_free_snapshot_version
    })
}
