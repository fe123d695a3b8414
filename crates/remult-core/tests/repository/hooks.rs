//! Tests for saving/deleting hooks and generated field values.

use std::sync::Arc;

use remult_core::{
    entity, error::ValidationError, EntityDefinition, Fields, InMemoryDataProvider, Remult,
    RemultError,
};
use serde_json::{json, Map, Value};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn notes() -> Arc<EntityDefinition> {
    entity("notes")
        .field("id", Fields::uuid())
        .field("text", Fields::string())
        .field("locked", Fields::boolean().default_value(|| json!(false)))
        .field("createdAt", Fields::created_at())
        .field("updatedAt", Fields::updated_at())
        .saving(|row, is_new| {
            if is_new {
                let trimmed = row.get("text").as_str().unwrap_or_default().trim().to_string();
                row.set("text", trimmed)?;
            }
            Ok(())
        })
        .deleting(|row| {
            if row.get("locked") == &json!(true) {
                return Err(ValidationError::entity("Locked notes cannot be deleted").into());
            }
            Ok(())
        })
        .validation(|row| {
            if row.get("text") == &json!("forbidden") {
                return Err(ValidationError::entity("Text is not allowed"));
            }
            Ok(())
        })
        .build()
}

#[tokio::test]
async fn defaults_and_generated_values() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&notes()).unwrap();

    let unsaved = repo.create(values(json!({ "text": "draft" }))).unwrap();
    assert_eq!(unsaved.get("locked"), &json!(false));
    let id = unsaved.get("id").as_str().unwrap().to_string();
    assert_eq!(id.len(), 36);

    let row = repo.insert(values(json!({ "text": "  hello  " }))).await.unwrap();
    assert_eq!(row.get("text"), &json!("hello"));
    assert!(row.get("createdAt").is_string());
    assert!(row.get("updatedAt").is_string());
    assert_ne!(row.get("id"), unsaved.get("id"));
}

#[tokio::test]
async fn created_at_is_kept_on_update() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&notes()).unwrap();

    let mut row = repo.insert(values(json!({ "text": "first" }))).await.unwrap();
    let created = row.get("createdAt").clone();

    row.set("text", "second").unwrap();
    repo.save(&mut row).await.unwrap();
    assert_eq!(row.get("createdAt"), &created);
    assert_eq!(row.get("text"), &json!("second"));
}

#[tokio::test]
async fn deleting_hook_can_veto() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&notes()).unwrap();

    let row = repo
        .insert(values(json!({ "text": "keep me", "locked": true })))
        .await
        .unwrap();
    let err = repo.delete_row(&row).await.unwrap_err();
    assert_eq!(err.to_string(), "Locked notes cannot be deleted");
    assert_eq!(repo.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn entity_validation_runs_after_fields() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&notes()).unwrap();

    let err = repo
        .insert(values(json!({ "text": "forbidden" })))
        .await
        .unwrap_err();
    match err {
        RemultError::Validation(e) => {
            assert_eq!(e.message, "Text is not allowed");
            assert!(e.field_errors.is_empty());
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(repo.count(None).await.unwrap(), 0);
}
