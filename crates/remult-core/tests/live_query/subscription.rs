//! Tests for src/live_query/server.rs over the in-memory query storage.

use std::sync::Arc;

use parking_lot::Mutex;
use remult_core::{
    entity,
    live_query::{
        InMemoryLiveQueryStorage, LiveQueryChange, LiveQueryStorage, LiveQuerySubscription,
        LiveQuerySubscriptionServer, StoredQuery,
    },
    EntityDefinition, Fields, FindOptions, InMemoryDataProvider, Remult, RemultOptions,
    Repository,
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

struct Setup {
    remult: Remult,
    server: Arc<LiveQuerySubscriptionServer>,
    storage: Arc<InMemoryLiveQueryStorage>,
}

impl Setup {
    fn new() -> Self {
        let storage = Arc::new(InMemoryLiveQueryStorage::new());
        let server = Arc::new(LiveQuerySubscriptionServer::new(storage.clone()));
        let remult = Remult::with_options(
            Arc::new(InMemoryDataProvider::new()),
            RemultOptions {
                live_query: Some(server.clone()),
                ..Default::default()
            },
        );
        Self {
            remult,
            server,
            storage,
        }
    }

    fn tasks(&self) -> Repository {
        self.remult.repo(&tasks()).unwrap()
    }

    async fn seed(&self, items: &[(&str, bool)]) {
        let repo = self.tasks();
        for (title, completed) in items {
            repo.insert(values(json!({ "title": title, "completed": completed })))
                .await
                .unwrap();
        }
        // Setup writes must not reach the subscriptions made afterwards.
        self.server.wait_for_dispatch().await;
    }

    async fn subscribe(&self, filter: Option<Value>) -> LiveQuerySubscription {
        self.server
            .subscribe(
                &self.tasks(),
                FindOptions {
                    filter,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    async fn next_changes(&self, sub: &mut LiveQuerySubscription) -> Option<Vec<LiveQueryChange>> {
        self.server.wait_for_dispatch().await;
        sub.receiver.try_recv().ok()
    }
}

#[tokio::test]
async fn result_set_changes_are_reported() {
    let setup = Setup::new();
    setup
        .seed(&[("Buy milk", false), ("Walk dog", true)])
        .await;
    let repo = setup.tasks();

    let mut sub = setup.subscribe(Some(json!({ "completed": false }))).await;
    assert_eq!(sub.items.len(), 1);
    let response = sub.response();
    assert_eq!(response["queryId"], json!(sub.query_id));
    assert_eq!(response["items"][0]["title"], json!("Buy milk"));

    repo.insert(values(json!({ "title": "Write code", "completed": false })))
        .await
        .unwrap();
    assert_eq!(
        setup.next_changes(&mut sub).await,
        Some(vec![LiveQueryChange::Added {
            id: json!(3),
            item: json!({ "id": 3, "title": "Write code", "completed": false }),
        }])
    );

    repo.update(&json!(1), values(json!({ "title": "Buy oat milk" })))
        .await
        .unwrap();
    assert_eq!(
        setup.next_changes(&mut sub).await,
        Some(vec![LiveQueryChange::Replaced {
            id: json!(1),
            old_id: json!(1),
            item: json!({ "id": 1, "title": "Buy oat milk", "completed": false }),
        }])
    );

    // Rows outside the result set stay silent.
    repo.update(&json!(2), values(json!({ "title": "Walk cat" })))
        .await
        .unwrap();
    assert_eq!(setup.next_changes(&mut sub).await, None);

    repo.delete(&json!(3)).await.unwrap();
    assert_eq!(
        setup.next_changes(&mut sub).await,
        Some(vec![LiveQueryChange::Removed { id: json!(3) }])
    );

    let stored = setup.storage.queries();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].data["ids"], json!([1]));
}

#[tokio::test]
async fn leaving_the_filter_removes_exactly_once() {
    let setup = Setup::new();
    setup.seed(&[("Buy milk", false)]).await;
    let repo = setup.tasks();
    let mut sub = setup.subscribe(Some(json!({ "completed": false }))).await;

    repo.update(&json!(1), values(json!({ "completed": true })))
        .await
        .unwrap();
    repo.update(&json!(1), values(json!({ "title": "Bought milk" })))
        .await
        .unwrap();
    setup.server.wait_for_dispatch().await;

    let mut batches = Vec::new();
    while let Ok(changes) = sub.receiver.try_recv() {
        batches.push(changes);
    }
    assert_eq!(
        batches,
        vec![vec![LiveQueryChange::Removed { id: json!(1) }]]
    );

    // Re-entering the filter adds it back.
    repo.update(&json!(1), values(json!({ "completed": false })))
        .await
        .unwrap();
    assert!(matches!(
        setup.next_changes(&mut sub).await.as_deref(),
        Some([LiveQueryChange::Added { .. }])
    ));
}

#[tokio::test]
async fn limit_window_is_not_reapplied() {
    let setup = Setup::new();
    setup.seed(&[("One", false), ("Two", false)]).await;
    let mut sub = setup
        .server
        .subscribe(
            &setup.tasks(),
            FindOptions {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sub.items.len(), 1);

    setup
        .tasks()
        .insert(values(json!({ "title": "Three", "completed": false })))
        .await
        .unwrap();
    assert!(matches!(
        setup.next_changes(&mut sub).await.as_deref(),
        Some([LiveQueryChange::Added { .. }])
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_queries_are_purged_and_never_notified() {
    let setup = Setup::new();
    setup
        .storage
        .add(StoredQuery {
            id: "forgotten".into(),
            entity_key: "tasks".into(),
            data: json!({ "ids": [] }),
            last_used_iso: "2000-01-01T00:00:00.000Z".into(),
        })
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = seen.clone();
        setup
            .server
            .on_message(move |message| seen.lock().push(message.query_id.clone()))
    };
    let sub = setup.subscribe(None).await;

    setup
        .tasks()
        .insert(values(json!({ "title": "Anything", "completed": false })))
        .await
        .unwrap();
    setup.server.wait_for_dispatch().await;

    assert_eq!(*seen.lock(), vec![sub.query_id.clone()]);
    let ids: Vec<String> = setup.storage.queries().into_iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![sub.query_id.clone()]);

    setup.server.off_message(listener);
    setup
        .tasks()
        .insert(values(json!({ "title": "Unheard", "completed": false })))
        .await
        .unwrap();
    setup.server.wait_for_dispatch().await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn keep_alive_reports_unknown_ids() {
    let setup = Setup::new();
    let mut sub = setup.subscribe(None).await;
    let before = setup.storage.queries()[0].last_used_iso.clone();

    let ids = vec![sub.query_id.clone(), "missing".to_string()];
    assert_eq!(setup.server.keep_alive(&ids).await, vec!["missing".to_string()]);
    assert_eq!(setup.server.keep_alive(&ids).await, vec!["missing".to_string()]);
    assert!(setup.storage.queries()[0].last_used_iso >= before);

    // Once the storage forgets a query, keep-alive closes its channel.
    setup.storage.remove(&sub.query_id).await.unwrap();
    assert_eq!(
        setup.server.keep_alive(&[sub.query_id.clone()]).await,
        vec![sub.query_id.clone()]
    );
    assert!(sub.receiver.recv().await.is_none());
}

#[tokio::test]
async fn unsubscribe_forgets_the_query() {
    let setup = Setup::new();
    let mut sub = setup.subscribe(None).await;
    let other = setup.subscribe(None).await;
    assert_eq!(setup.storage.queries().len(), 2);

    setup.server.unsubscribe(&sub.query_id).await.unwrap();
    let ids: Vec<String> = setup.storage.queries().into_iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![other.query_id.clone()]);
    assert!(sub.receiver.recv().await.is_none());

    // Unknown ids are ignored.
    setup.server.unsubscribe("missing").await.unwrap();
}
