//! Tests for src/live_query/provider_storage.rs.

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use remult_core::{
    converters::format_date,
    entity,
    live_query::{
        provider_storage::STORAGE_DB_NAME, DataProviderLiveQueryStorage, LiveQueryChange,
        LiveQueryStorage, LiveQuerySubscriptionServer, StoredQuery,
    },
    EntityDefinition, Fields, FindOptions, InMemoryDataProvider, Remult, RemultOptions,
};
use serde_json::{json, Map, Value};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn tasks() -> Arc<EntityDefinition> {
    entity("tasks")
        .field("id", Fields::auto_increment())
        .field("title", Fields::string())
        .field("completed", Fields::boolean())
        .build()
}

fn query(id: &str, last_used_iso: String) -> StoredQuery {
    StoredQuery {
        id: id.into(),
        entity_key: "tasks".into(),
        data: json!({ "ids": [1, 2] }),
        last_used_iso,
    }
}

fn storage_over(provider: &InMemoryDataProvider) -> DataProviderLiveQueryStorage {
    DataProviderLiveQueryStorage::new(Arc::new(provider.clone())).unwrap()
}

#[tokio::test]
async fn ensure_schema_creates_the_table() {
    let provider = InMemoryDataProvider::new();
    let storage = storage_over(&provider);
    assert!(!provider.has_table(STORAGE_DB_NAME));

    storage.ensure_schema().await.unwrap();
    assert!(provider.has_table(STORAGE_DB_NAME));
    assert!(provider.rows(STORAGE_DB_NAME).is_empty());
}

#[tokio::test]
async fn stored_queries_round_trip_through_the_provider() {
    let provider = InMemoryDataProvider::new();
    let storage = storage_over(&provider);

    storage.add(query("q1", format_date(&Utc::now()))).await.unwrap();
    let stored = provider.rows(STORAGE_DB_NAME);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["entityKey"], json!("tasks"));
    // Data is kept as serialized text.
    assert_eq!(stored[0]["data"], json!(r#"{"ids":[1,2]}"#));

    // Adding the same id replaces the stored query.
    let mut replacement = query("q1", format_date(&Utc::now()));
    replacement.data = json!({ "ids": [] });
    storage.add(replacement.clone()).await.unwrap();
    assert_eq!(provider.rows(STORAGE_DB_NAME).len(), 1);
    assert_eq!(storage.live_queries("tasks").await.unwrap(), vec![replacement]);

    storage.set_data("q1", json!({ "ids": [7] })).await.unwrap();
    let live = storage.live_queries("tasks").await.unwrap();
    assert_eq!(live[0].data, json!({ "ids": [7] }));
    assert!(storage.live_queries("orders").await.unwrap().is_empty());

    storage.remove("q1").await.unwrap();
    storage.remove("q1").await.unwrap();
    assert!(provider.rows(STORAGE_DB_NAME).is_empty());
}

#[tokio::test]
async fn stale_rows_are_deleted_on_read() {
    let provider = InMemoryDataProvider::new();
    let storage = storage_over(&provider);
    let old = format_date(&(Utc::now() - Duration::minutes(10)));

    storage.add(query("fresh", format_date(&Utc::now()))).await.unwrap();
    storage.add(query("stale", old)).await.unwrap();

    let live = storage.live_queries("tasks").await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "fresh");
    assert_eq!(provider.rows(STORAGE_DB_NAME).len(), 1);
}

#[tokio::test]
async fn keep_alive_refreshes_known_ids() {
    let provider = InMemoryDataProvider::new();
    let storage = storage_over(&provider);
    let old = format_date(&(Utc::now() - Duration::minutes(4)));
    storage.add(query("q1", old.clone())).await.unwrap();

    let unknown = storage
        .keep_alive_and_return_unknown_query_ids(&["q1".to_string(), "q2".to_string()])
        .await
        .unwrap();
    assert_eq!(unknown, vec!["q2".to_string()]);

    let live = storage.live_queries("tasks").await.unwrap();
    assert!(live[0].last_used_iso > old);

    assert!(storage
        .keep_alive_and_return_unknown_query_ids(&[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn servers_sharing_a_database_see_each_others_queries() {
    let provider = InMemoryDataProvider::new();
    let server_for = |provider: &InMemoryDataProvider| {
        let server = Arc::new(LiveQuerySubscriptionServer::new(Arc::new(storage_over(
            provider,
        ))));
        let remult = Remult::with_options(
            Arc::new(provider.clone()),
            RemultOptions {
                live_query: Some(server.clone()),
                ..Default::default()
            },
        );
        (remult, server)
    };
    let (first, first_server) = server_for(&provider);
    let (second, second_server) = server_for(&provider);

    let mut sub = first_server
        .subscribe(&first.repo(&tasks()).unwrap(), FindOptions::default())
        .await
        .unwrap();
    assert!(sub.items.is_empty());

    let relayed = Arc::new(Mutex::new(Vec::new()));
    {
        let relayed = relayed.clone();
        second_server.on_message(move |message| relayed.lock().push(message.clone()));
    }

    // A write through the second server reaches the first server's query
    // through the shared storage.
    second
        .repo(&tasks())
        .unwrap()
        .insert(values(json!({ "title": "Shared", "completed": false })))
        .await
        .unwrap();
    second_server.wait_for_dispatch().await;

    let relayed = relayed.lock().clone();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].query_id, sub.query_id);
    assert!(matches!(
        relayed[0].changes.as_slice(),
        [LiveQueryChange::Added { id, .. }] if id == &json!(1)
    ));

    // The stored ids now include the new row, so a write through the first
    // server is a replacement.
    first
        .repo(&tasks())
        .unwrap()
        .update(&json!(1), values(json!({ "completed": true })))
        .await
        .unwrap();
    first_server.wait_for_dispatch().await;
    assert!(matches!(
        sub.receiver.try_recv().unwrap().as_slice(),
        [LiveQueryChange::Replaced { .. }]
    ));
}
