use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync_engine::firestore::core::OrderBy;
use firestore_sync_engine::firestore::error::{failed_precondition, FirestoreErrorCode};
use firestore_sync_engine::firestore::settings::{BackoffSettings, RemoteStoreSettings};
use firestore_sync_engine::firestore::{
    ChangeType, DatabaseId, DocumentKey, FieldPath, FilterOperator, FirestoreClient,
    FirestoreResult, FirestoreSettings, FirestoreValue, InMemoryStreamingDatastore,
    ListenOptions, ListenerRegistration, PersistenceSettings, Query, ResourcePath,
    ServerStream, ViewSnapshot,
};
use serde_json::json;

const DOCS: &str = "projects/p/databases/(default)/documents";

type Snapshots = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

fn settings() -> FirestoreSettings {
    FirestoreSettings {
        remote_store: RemoteStoreSettings {
            backoff: BackoffSettings {
                initial_delay: Duration::from_millis(5),
                backoff_factor: 1.5,
                max_delay: Duration::from_millis(20),
                jitter_factor: 0.0,
            },
            ..RemoteStoreSettings::default()
        },
        ..FirestoreSettings::default()
    }
    .with_database_id(DatabaseId::new("p", "(default)"))
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap())
}

fn likes(value: i64) -> BTreeMap<String, FirestoreValue> {
    BTreeMap::from([("likes".to_string(), FirestoreValue::from_integer(value))])
}

fn fields(entries: &[(&str, i64)]) -> BTreeMap<String, FirestoreValue> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), FirestoreValue::from_integer(*value)))
        .collect()
}

/// Integer field of the first document in the snapshot.
fn integer_field(snapshot: &ViewSnapshot, name: &str) -> Option<i64> {
    let field = FieldPath::from_dot_separated(name).unwrap();
    snapshot
        .docs
        .iter()
        .next()?
        .field(&field)
        .and_then(FirestoreValue::as_integer)
}

fn likes_of(snapshot: &ViewSnapshot) -> Vec<i64> {
    let field = FieldPath::from_dot_separated("likes").unwrap();
    snapshot
        .docs
        .iter()
        .filter_map(|document| document.field(&field).and_then(FirestoreValue::as_integer))
        .collect()
}

async fn listen(client: &FirestoreClient, query: Query) -> (Snapshots, ListenerRegistration) {
    let snapshots: Snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let registration = client
        .listen(query, ListenOptions::default(), move |result| {
            sink.lock().unwrap().push(result);
        })
        .await
        .unwrap();
    (snapshots, registration)
}

fn latest(snapshots: &Snapshots) -> ViewSnapshot {
    match snapshots.lock().unwrap().last() {
        Some(Ok(snapshot)) => snapshot.clone(),
        other => panic!("unexpected snapshot {other:?}"),
    }
}

/// Document count of the latest snapshot, if one was raised.
fn doc_count(snapshots: &Snapshots) -> Option<usize> {
    match snapshots.lock().unwrap().last() {
        Some(Ok(snapshot)) => Some(snapshot.docs.len()),
        _ => None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn send_document(server: &ServerStream, path: &str, likes: i64, target_ids: &[i64]) {
    server
        .send_json(&json!({ "documentChange": {
            "document": {
                "name": format!("{DOCS}/{path}"),
                "fields": { "likes": { "integerValue": likes.to_string() } },
                "updateTime": "2024-01-01T00:00:00Z"
            },
            "targetIds": target_ids
        }}))
        .await
        .unwrap();
}

async fn acknowledge(server: &ServerStream, target_ids: &[i64]) {
    server
        .send_json(&json!({ "targetChange": {
            "targetChangeType": "ADD", "targetIds": target_ids
        }}))
        .await
        .unwrap();
}

async fn send_read_time(server: &ServerStream, read_time: &str) {
    server
        .send_json(&json!({ "targetChange": { "readTime": read_time } }))
        .await
        .unwrap();
}

async fn mark_current(server: &ServerStream, target_ids: &[i64], read_time: &str) {
    server
        .send_json(&json!({ "targetChange": {
            "targetChangeType": "CURRENT", "targetIds": target_ids, "resumeToken": "dG9r"
        }}))
        .await
        .unwrap();
    send_read_time(server, read_time).await;
}

/// Completes the write stream handshake and returns the first write request.
async fn handshake(server: &ServerStream) -> serde_json::Value {
    let opening = server.recv_json().await.unwrap();
    assert_eq!(opening, json!({ "database": "projects/p/databases/(default)" }));
    server.send_json(&json!({ "streamToken": "dG9r" })).await.unwrap();
    server.recv_json().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_filtered_limit_query_is_served_from_cache() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    client.disable_network().await.unwrap();

    let query = rooms()
        .where_field("likes", FilterOperator::GreaterThan, FirestoreValue::from_integer(10))
        .unwrap()
        .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("likes").unwrap()))
        .with_limit_to_first(5);
    let (snapshots, _registration) = listen(&client, query).await;
    assert!(latest(&snapshots).docs.is_empty());
    assert!(latest(&snapshots).from_cache);

    let mut batch = client.write_batch();
    for (index, value) in [3, 25, 11, 40, 10, 17, 12, 99].into_iter().enumerate() {
        batch.set(&key(&format!("rooms/r{index}")), likes(value)).unwrap();
    }
    let commit = tokio::spawn(async move { batch.commit().await });

    wait_until(|| {
        matches!(snapshots.lock().unwrap().last(), Some(Ok(snapshot)) if snapshot.docs.len() == 5)
    })
    .await;
    let snapshot = latest(&snapshots);
    assert_eq!(likes_of(&snapshot), vec![11, 12, 17, 25, 40]);
    assert!(snapshot.from_cache);
    assert!(snapshot.has_pending_writes());
    assert_eq!(datastore.listen_streams_opened(), 0);
    assert_eq!(datastore.write_streams_opened(), 0);

    client.terminate().await;
    let err = commit.await.unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn set_and_update_are_acknowledged_in_one_batch() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;

    let mut batch = client.write_batch();
    batch.set(&key("rooms/eros"), likes(1)).unwrap();
    batch.update(&key("rooms/eros"), likes(2)).unwrap();
    let commit = tokio::spawn(async move { batch.commit().await });

    wait_until(|| {
        matches!(snapshots.lock().unwrap().last(), Some(Ok(snapshot)) if snapshot.docs.len() == 1)
    })
    .await;
    let local = latest(&snapshots);
    assert_eq!(likes_of(&local), vec![2]);
    assert!(local.has_pending_writes());

    let server = datastore.accept_write().await.unwrap();
    let request = handshake(&server).await;
    let writes = request["writes"].as_array().unwrap();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0]["update"]["name"], format!("{DOCS}/rooms/eros"));
    assert_eq!(writes[1]["updateMask"]["fieldPaths"], json!(["likes"]));
    assert_eq!(writes[1]["currentDocument"], json!({ "exists": true }));

    server
        .send_json(&json!({
            "streamToken": "dG9yMg==",
            "commitTime": "2024-01-01T00:00:05Z",
            "writeResults": [
                { "updateTime": "2024-01-01T00:00:05Z" },
                { "updateTime": "2024-01-01T00:00:05Z" }
            ]
        }))
        .await
        .unwrap();
    commit.await.unwrap().unwrap();

    let cached = client.get_document(&key("rooms/eros")).await.unwrap();
    assert!(cached.is_found_document());
    assert!(!cached.has_local_mutations());
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_update_restores_previous_view() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;

    let watch = datastore.accept_listen().await.unwrap();
    let add = watch.recv_json().await.unwrap();
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap();
    acknowledge(&watch, &[target_id]).await;
    send_document(&watch, "rooms/eros", 5, &[target_id]).await;
    mark_current(&watch, &[target_id], "2024-01-01T00:00:01Z").await;
    wait_until(|| {
        matches!(snapshots.lock().unwrap().last(), Some(Ok(snapshot)) if !snapshot.from_cache)
    })
    .await;
    assert_eq!(likes_of(&latest(&snapshots)), vec![5]);

    let mut batch = client.write_batch();
    batch.update(&key("rooms/eros"), likes(6)).unwrap();
    let commit = tokio::spawn(async move { batch.commit().await });
    wait_until(|| likes_of(&latest(&snapshots)) == vec![6]).await;

    let server = datastore.accept_write().await.unwrap();
    handshake(&server).await;
    server.fail(failed_precondition("document changed")).await;

    let err = commit.await.unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    wait_until(|| likes_of(&latest(&snapshots)) == vec![5]).await;
    assert!(!latest(&snapshots).has_pending_writes());
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_first_write_keeps_later_update() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;

    let watch = datastore.accept_listen().await.unwrap();
    let add = watch.recv_json().await.unwrap();
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap();
    acknowledge(&watch, &[target_id]).await;
    send_document(&watch, "rooms/eros", 5, &[target_id]).await;
    mark_current(&watch, &[target_id], "2024-01-01T00:00:01Z").await;
    wait_until(|| {
        matches!(snapshots.lock().unwrap().last(), Some(Ok(snapshot)) if !snapshot.from_cache)
    })
    .await;

    let mut first = client.write_batch();
    first.set(&key("rooms/eros"), fields(&[("a", 1)])).unwrap();
    let set_commit = tokio::spawn(async move { first.commit().await });
    wait_until(|| integer_field(&latest(&snapshots), "a") == Some(1)).await;

    let mut second = client.write_batch();
    second.update(&key("rooms/eros"), fields(&[("b", 2)])).unwrap();
    let update_commit = tokio::spawn(async move { second.commit().await });
    wait_until(|| integer_field(&latest(&snapshots), "b") == Some(2)).await;
    assert_eq!(integer_field(&latest(&snapshots), "likes"), None);

    let server = datastore.accept_write().await.unwrap();
    let request = handshake(&server).await;
    assert!(request["writes"][0].get("updateMask").is_none());
    server.fail(failed_precondition("document changed")).await;

    let err = set_commit.await.unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    wait_until(|| integer_field(&latest(&snapshots), "a").is_none()).await;
    let snapshot = latest(&snapshots);
    assert_eq!(integer_field(&snapshot, "likes"), Some(5));
    assert_eq!(integer_field(&snapshot, "b"), Some(2));
    assert!(snapshot.has_pending_writes());

    let retry = datastore.accept_write().await.expect("write stream reopened");
    let resent = handshake(&retry).await;
    assert_eq!(resent["writes"][0]["updateMask"]["fieldPaths"], json!(["b"]));
    retry
        .send_json(&json!({
            "streamToken": "dG9yMg==",
            "commitTime": "2024-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "2024-01-01T00:00:05Z" }]
        }))
        .await
        .unwrap();
    update_commit.await.unwrap().unwrap();
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_server_document_raises_no_extra_snapshot() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;

    let watch = datastore.accept_listen().await.unwrap();
    let add = watch.recv_json().await.unwrap();
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap();
    acknowledge(&watch, &[target_id]).await;
    send_document(&watch, "rooms/a", 1, &[target_id]).await;
    mark_current(&watch, &[target_id], "2024-01-01T00:00:01Z").await;
    wait_until(|| {
        matches!(snapshots.lock().unwrap().last(), Some(Ok(snapshot)) if !snapshot.from_cache)
    })
    .await;
    let raised = snapshots.lock().unwrap().len();

    send_document(&watch, "rooms/a", 1, &[target_id]).await;
    send_read_time(&watch, "2024-01-01T00:00:02Z").await;
    send_document(&watch, "rooms/b", 2, &[target_id]).await;
    send_read_time(&watch, "2024-01-01T00:00:03Z").await;
    wait_until(|| doc_count(&snapshots) == Some(2)).await;

    assert_eq!(snapshots.lock().unwrap().len(), raised + 1);
    let snapshot = latest(&snapshots);
    assert_eq!(snapshot.doc_changes.len(), 1);
    assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Added);
    assert_eq!(snapshot.doc_changes[0].document.key(), &key("rooms/b"));
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_mismatch_requeries_without_resume_token() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;

    let watch = datastore.accept_listen().await.unwrap();
    let add = watch.recv_json().await.unwrap();
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap();
    acknowledge(&watch, &[target_id]).await;
    send_document(&watch, "rooms/a", 1, &[target_id]).await;
    send_document(&watch, "rooms/b", 2, &[target_id]).await;
    mark_current(&watch, &[target_id], "2024-01-01T00:00:01Z").await;
    wait_until(|| doc_count(&snapshots) == Some(2)).await;

    watch
        .send_json(&json!({ "filter": { "targetId": target_id, "count": 1 } }))
        .await
        .unwrap();
    send_read_time(&watch, "2024-01-01T00:00:02Z").await;

    let remove = watch.recv_json().await.unwrap();
    assert_eq!(remove["removeTarget"], json!(target_id));
    let readd = watch.recv_json().await.unwrap();
    assert_eq!(readd["addTarget"]["targetId"], json!(target_id));
    assert!(readd["addTarget"].get("resumeToken").is_none());
    assert!(readd["addTarget"].get("readTime").is_none());
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn limbo_resolutions_are_capped_at_one_hundred() {
    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(settings(), Arc::new(datastore.clone())).unwrap();
    let (snapshots, _registration) = listen(&client, rooms()).await;
    let watch = datastore.accept_listen().await.unwrap();
    let add = watch.recv_json().await.unwrap();
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap();
    acknowledge(&watch, &[target_id]).await;
    for index in 0..120 {
        send_document(&watch, &format!("rooms/r{index:03}"), index, &[target_id]).await;
    }
    mark_current(&watch, &[target_id], "2024-01-01T00:00:01Z").await;
    wait_until(|| doc_count(&snapshots) == Some(120)).await;

    watch
        .send_json(&json!({ "targetChange": {
            "targetChangeType": "RESET", "targetIds": [target_id]
        }}))
        .await
        .unwrap();
    mark_current(&watch, &[target_id], "2024-01-01T00:00:02Z").await;

    let sync_engine = client.sync_engine().clone();
    wait_until(|| sync_engine.active_limbo_resolutions().len() == 100).await;
    assert_eq!(sync_engine.enqueued_limbo_resolutions().len(), 20);
    assert!(sync_engine
        .active_limbo_resolutions()
        .values()
        .all(|target_id| target_id % 2 == 1));
    client.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_cache_survives_client_restart() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceSettings::Durable {
        path: dir.path().join("cache.redb"),
    };

    {
        let client = FirestoreClient::new(
            settings().with_persistence(persistence.clone()),
            Arc::new(InMemoryStreamingDatastore::new()),
        )
        .unwrap();
        client.disable_network().await.unwrap();
        let mut batch = client.write_batch();
        batch.set(&key("rooms/eros"), likes(12)).unwrap();
        let commit = tokio::spawn(async move { batch.commit().await });
        let reader = client.clone();
        let mut cached = false;
        for _ in 0..400 {
            if reader.get_document(&key("rooms/eros")).await.is_ok() {
                cached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cached);
        client.terminate().await;
        assert!(commit.await.unwrap().is_err());
    }

    let datastore = InMemoryStreamingDatastore::new();
    let client = FirestoreClient::new(
        settings().with_persistence(persistence),
        Arc::new(datastore.clone()),
    )
    .unwrap();
    let document = client.get_document(&key("rooms/eros")).await.unwrap();
    assert!(document.has_local_mutations());

    // The unacknowledged write is sent again once the client is online.
    let server = datastore.accept_write().await.unwrap();
    let request = handshake(&server).await;
    assert_eq!(
        request["writes"][0]["update"]["name"],
        format!("{DOCS}/rooms/eros")
    );
    client.terminate().await;
}
