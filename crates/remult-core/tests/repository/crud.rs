//! Tests for src/repository/mod.rs: reads, writes and the identity cache.

use std::sync::Arc;

use remult_core::{
    entity, error::RemultError, EntityDefinition, Fields, FindIdOptions, FindOptions,
    InMemoryDataProvider, Remult, SortEntry,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

fn tasks() -> Arc<EntityDefinition> {
    entity("tasks")
        .field("id", Fields::auto_increment())
        .field("title", Fields::string().min_length(3))
        .field("completed", Fields::boolean())
        .build()
}

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn setup() -> (Remult, InMemoryDataProvider) {
    let provider = InMemoryDataProvider::new();
    (Remult::new(provider.clone()), provider)
}

#[tokio::test]
async fn insert_then_find_id_round_trips() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();

    let inserted = repo
        .insert(values(json!({ "title": "Buy milk", "completed": false })))
        .await
        .unwrap();
    assert_eq!(inserted.get("id"), &json!(1));
    assert!(!inserted.is_new());

    let found = repo
        .find_id(
            &json!(1),
            FindIdOptions {
                use_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.to_value(), inserted.to_value());
    assert_eq!(
        Value::Object(found.to_value()),
        json!({ "id": 1, "title": "Buy milk", "completed": false })
    );
}

#[tokio::test]
async fn counts_and_filters_over_three_rows() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    for (title, completed) in [("Task one", false), ("Task two", true), ("Task three", false)] {
        repo.insert(values(json!({ "title": title, "completed": completed })))
            .await
            .unwrap();
    }

    assert_eq!(repo.count(None).await.unwrap(), 3);
    assert_eq!(
        repo.count(Some(&json!({ "completed": true }))).await.unwrap(),
        1
    );

    let rows = repo
        .find(FindOptions {
            filter: Some(json!({ "id": 2 })),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("completed"), &json!(true));
}

#[tokio::test]
async fn find_sorts_and_pages() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    for title in ["Alpha", "Charlie", "Bravo", "Delta"] {
        repo.insert(values(json!({ "title": title, "completed": false })))
            .await
            .unwrap();
    }

    let rows = repo
        .find(FindOptions {
            order_by: Some(vec![SortEntry::desc("title")]),
            limit: Some(2),
            page: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    let titles: Vec<&Value> = rows.iter().map(|r| r.get("title")).collect();
    assert_eq!(titles, vec![&json!("Bravo"), &json!("Alpha")]);

    let first = repo
        .find_first(FindOptions {
            filter: Some(json!({ "title": { "$startsWith": "c" } })),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get("title"), &json!("Charlie"));
}

#[tokio::test]
async fn update_writes_changed_columns_only() {
    let (remult, provider) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    repo.insert(values(json!({ "title": "Original", "completed": false })))
        .await
        .unwrap();

    // A column changed behind the repository's back survives an update that
    // does not touch it.
    let mut stored = provider.rows("tasks");
    stored[0].insert("title".into(), json!("Changed elsewhere"));
    provider.seed("tasks", stored);

    let mut row = repo
        .find_id(&json!(1), FindIdOptions::default())
        .await
        .unwrap();
    assert_eq!(row.get("title"), &json!("Original"));
    row.set("completed", true).unwrap();
    assert_eq!(row.changed_fields(), vec!["completed".to_string()]);
    repo.save(&mut row).await.unwrap();

    assert_eq!(row.get("title"), &json!("Changed elsewhere"));
    assert_eq!(
        provider.rows("tasks")[0].get("completed"),
        Some(&json!(true))
    );
    assert!(row.changed_fields().is_empty());
}

#[tokio::test]
async fn update_by_id_applies_changes() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    repo.insert(values(json!({ "title": "Write tests", "completed": false })))
        .await
        .unwrap();

    let row = repo
        .update(&json!(1), values(json!({ "completed": true })))
        .await
        .unwrap();
    assert_eq!(row.get("completed"), &json!(true));
    assert_eq!(
        repo.count(Some(&json!({ "completed": true }))).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn delete_removes_row_and_cache_entry() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    let row = repo
        .insert(values(json!({ "title": "Temporary", "completed": false })))
        .await
        .unwrap();
    assert!(repo.cached(&json!(1)).is_some());

    repo.delete_row(&row).await.unwrap();
    assert_eq!(repo.count(None).await.unwrap(), 0);
    assert!(repo.cached(&json!(1)).is_none());

    let err = repo.delete(&json!(1)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn find_id_miss() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();

    let err = repo
        .find_id(&json!(42), FindIdOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RemultError::NotFound { ref id, .. } if id == "42"));
    assert_eq!(err.to_string(), "tasks with id \"42\" not found");

    let created = repo
        .find_id(
            &json!(42),
            FindIdOptions {
                create_if_not_found: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(created.is_new());
    assert_eq!(created.get("id"), &json!(42));
}

#[tokio::test]
async fn insert_many_reports_failures_per_item() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();

    let result = repo
        .insert_many(vec![
            values(json!({ "title": "Valid one", "completed": false })),
            values(json!({ "title": "no", "completed": false })),
            values(json!({ "title": "Valid two", "completed": true })),
        ])
        .await;
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, 1);
    assert!(result.errors[0].1.validation().is_some());
    assert_eq!(repo.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn unknown_filter_field_is_a_query_error() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    let err = repo
        .count(Some(&json!({ "missing": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, RemultError::Query(_)));
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Task {
    id: Option<i64>,
    title: String,
    completed: bool,
}

#[tokio::test]
async fn typed_insert_and_read() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();

    let row = repo
        .insert_typed(&Task {
            id: None,
            title: "Typed task".into(),
            completed: true,
        })
        .await
        .unwrap();
    let task: Task = row.to_typed().unwrap();
    assert_eq!(
        task,
        Task {
            id: Some(1),
            title: "Typed task".into(),
            completed: true,
        }
    );
}

#[tokio::test]
async fn wire_round_trip() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    let row = repo
        .insert(values(json!({ "title": "On the wire", "completed": false })))
        .await
        .unwrap();

    let wire = repo.to_json(&row).unwrap();
    assert_eq!(wire, json!({ "id": 1, "title": "On the wire", "completed": false }));

    let mut back = repo.from_json(&wire, false).unwrap();
    assert!(!back.is_new());
    assert!(back.changed_fields().is_empty());
    back.set("completed", true).unwrap();
    repo.save(&mut back).await.unwrap();
    assert_eq!(
        repo.count(Some(&json!({ "completed": true }))).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn undecodable_wire_value_fails_on_save() {
    let (remult, _) = setup();
    let repo = remult.repo(&tasks()).unwrap();

    let mut row = repo
        .from_json(&json!({ "title": "Bad flag", "completed": "maybe" }), true)
        .unwrap();
    assert!(row.conversion_errors().contains_key("completed"));

    let err = repo.save(&mut row).await.unwrap_err();
    let validation = err.validation().unwrap();
    assert!(validation.field_error("completed").is_some());
    assert_eq!(repo.count(None).await.unwrap(), 0);
}

fn memberships() -> Arc<EntityDefinition> {
    entity("memberships")
        .id(["team", "user"])
        .field("team", Fields::string())
        .field("user", Fields::integer())
        .field("role", Fields::string())
        .build()
}

#[tokio::test]
async fn compound_ids() {
    let (remult, _) = setup();
    let repo = remult.repo(&memberships()).unwrap();
    let row = repo
        .insert(values(json!({ "team": "core", "user": 7, "role": "admin" })))
        .await
        .unwrap();
    assert_eq!(row.id(), json!("core,7"));

    let found = repo
        .find_id(
            &json!("core,7"),
            FindIdOptions {
                use_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.get("role"), &json!("admin"));

    let err = repo
        .insert(values(json!({ "team": "core", "user": 7, "role": "viewer" })))
        .await
        .unwrap_err();
    assert!(matches!(err, RemultError::Provider(_)));
}

#[tokio::test]
async fn cache_serves_repeated_reads() {
    let (remult, provider) = setup();
    let repo = remult.repo(&tasks()).unwrap();
    repo.insert(values(json!({ "title": "Cached", "completed": false })))
        .await
        .unwrap();
    repo.clear_cache();
    assert!(repo.cached(&json!(1)).is_none());

    let first = repo.load_cached(&json!(1)).await.unwrap().unwrap();
    provider.seed("tasks", Vec::new());
    let second = repo.load_cached(&json!(1)).await.unwrap().unwrap();
    assert_eq!(first.to_value(), second.to_value());

    assert!(repo.load_cached(&json!(2)).await.unwrap().is_none());
    assert!(matches!(repo.cached(&json!(2)), Some(None)));
}
