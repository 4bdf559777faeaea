use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::online_state::OnlineState;
use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only differ in `from_cache` or pending-write state.
    pub include_metadata_changes: bool,
    /// Hold back cache-only results while the client may still reach the backend.
    pub wait_for_sync_when_online: bool,
}

/// A snapshot or error ready to be handed to a listener callback.
///
/// Events are collected while engine state is locked and dispatched afterwards.
pub struct ListenerEvent {
    callback: SnapshotCallback,
    result: FirestoreResult<ViewSnapshot>,
}

impl ListenerEvent {
    pub fn dispatch(self) {
        (self.callback)(self.result);
    }

    pub fn result(&self) -> &FirestoreResult<ViewSnapshot> {
        &self.result
    }
}

impl Debug for ListenerEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEvent")
            .field("result", &self.result)
            .finish()
    }
}

struct QueryListener {
    id: u64,
    options: ListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> Option<ListenerEvent> {
        let mut snapshot = snapshot;
        if !self.options.include_metadata_changes {
            snapshot
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let event = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                Some(self.raise_initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(self.event(Ok(snapshot.clone())))
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        event
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ListenerEvent> {
        self.online_state = online_state;
        let snapshot = self.snapshot.clone()?;
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            return Some(self.raise_initial_event(&snapshot));
        }
        None
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Raise cached results, or an empty result once we know we are offline.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .map(|previous| previous.has_pending_writes() != snapshot.has_pending_writes())
            .unwrap_or(false);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ListenerEvent {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.event(Ok(initial))
    }

    fn event(&self, result: FirestoreResult<ViewSnapshot>) -> ListenerEvent {
        ListenerEvent {
            callback: Arc::clone(&self.callback),
            result,
        }
    }
}

struct QueryListeners {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Fans view snapshots out to every listener of a query, keyed by the
/// query's canonical id.
#[derive(Default)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListeners>,
    online_state: OnlineState,
    next_listener_id: u64,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Returns its id, whether it is the first listener
    /// for the query, and an event replaying the current snapshot if one exists.
    pub fn add_listener(
        &mut self,
        query: &Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> (u64, bool, Option<ListenerEvent>) {
        self.next_listener_id += 1;
        let id = self.next_listener_id;
        let online_state = self.online_state;
        let entry = self
            .queries
            .entry(query.canonical_id())
            .or_insert_with(|| QueryListeners {
                query: query.clone(),
                view_snapshot: None,
                listeners: Vec::new(),
            });
        let first = entry.listeners.is_empty();

        let mut listener = QueryListener {
            id,
            options,
            callback,
            raised_initial_event: false,
            snapshot: None,
            online_state,
        };
        let replay = entry
            .view_snapshot
            .clone()
            .and_then(|snapshot| listener.on_view_snapshot(snapshot));
        entry.listeners.push(listener);
        (id, first, replay)
    }

    /// Removes a listener. Returns the query when it was the last listener.
    pub fn remove_listener(&mut self, canonical_id: &str, listener_id: u64) -> Option<Query> {
        let entry = self.queries.get_mut(canonical_id)?;
        entry.listeners.retain(|listener| listener.id != listener_id);
        if entry.listeners.is_empty() {
            return self.queries.remove(canonical_id).map(|entry| entry.query);
        }
        None
    }

    pub fn has_listeners(&self, canonical_id: &str) -> bool {
        self.queries
            .get(canonical_id)
            .map(|entry| !entry.listeners.is_empty())
            .unwrap_or(false)
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut entry.listeners {
                events.extend(listener.on_view_snapshot(snapshot.clone()));
            }
            entry.view_snapshot = Some(snapshot);
        }
        events
    }

    /// Delivers a listen error and forgets the query.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) -> Vec<ListenerEvent> {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return Vec::new();
        };
        entry
            .listeners
            .iter()
            .map(|listener| listener.event(Err(error.clone())))
            .collect()
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) -> Vec<ListenerEvent> {
        self.online_state = online_state;
        let mut events = Vec::new();
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                events.extend(listener.apply_online_state_change(online_state));
            }
        }
        events
    }
}
