//! Tests for src/validation/engine.rs as driven by Repository::save.

use std::sync::Arc;

use remult_core::{
    entity, field::FieldDeclaration, validation::Verdict, EntityDefinition, Fields,
    InMemoryDataProvider, Remult, RemultOptions, Validators,
};
use serde_json::{json, Map, Value};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn todos() -> Arc<EntityDefinition> {
    entity("todos")
        .field("id", Fields::auto_increment())
        .field("name", Fields::string().min_length(3))
        .field("completed", Fields::boolean())
        .build()
}

#[tokio::test]
async fn min_length_rejects_empty_name_without_writing() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&todos()).unwrap();
    let before = repo.count(None).await.unwrap();

    let err = repo
        .insert(values(json!({ "name": "", "completed": false })))
        .await
        .unwrap_err();
    let validation = err.validation().expect("validation error");
    assert_eq!(
        validation.field_error("name"),
        Some("Value must be at least 3 characters")
    );
    assert_eq!(
        validation.message,
        "Name: Value must be at least 3 characters"
    );
    assert_eq!(repo.count(None).await.unwrap(), before);
}

fn accounts() -> Arc<EntityDefinition> {
    entity("accounts")
        .field("id", Fields::auto_increment())
        .field(
            "email",
            Fields::string()
                .required()
                .validate(Validators::email())
                .validate(Validators::unique()),
        )
        .field(
            "plan",
            Fields::string().validate(Validators::in_values(vec![json!("free"), json!("pro")])),
        )
        .field(
            "nickname",
            FieldDeclaration::new()
                .caption("Display name")
                .validate(Validators::max_length(8).with_message("too long")),
        )
        .build()
}

#[tokio::test]
async fn failures_accumulate_across_fields_first_per_field() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&accounts()).unwrap();

    let err = repo
        .insert(values(json!({
            "email": "",
            "plan": "gold",
            "nickname": "much too long",
        })))
        .await
        .unwrap_err();
    let validation = err.validation().unwrap();
    assert_eq!(validation.field_error("email"), Some("Should not be empty"));
    assert_eq!(
        validation.field_error("plan"),
        Some("Value must be one of free, pro")
    );
    assert_eq!(validation.field_error("nickname"), Some("too long"));
    assert_eq!(validation.message, "eMail: Should not be empty");
}

#[tokio::test]
async fn unique_consults_provider_only_on_backend() {
    let provider = InMemoryDataProvider::new();
    let backend = Remult::new(provider.clone());
    let frontend = Remult::with_options(
        Arc::new(provider.clone()),
        RemultOptions {
            backend: false,
            ..Default::default()
        },
    );

    let repo = backend.repo(&accounts()).unwrap();
    repo.insert(values(json!({ "email": "a@example.com", "plan": "free" })))
        .await
        .unwrap();

    let err = repo
        .insert(values(json!({ "email": "a@example.com", "plan": "pro" })))
        .await
        .unwrap_err();
    assert_eq!(
        err.validation().unwrap().field_error("email"),
        Some("already exists")
    );

    let front = frontend.repo(&accounts()).unwrap();
    front
        .insert(values(json!({ "email": "a@example.com", "plan": "pro" })))
        .await
        .unwrap();
    assert_eq!(repo.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn existing_rows_validate_changed_fields_only() {
    let provider = InMemoryDataProvider::new();
    provider.seed(
        "accounts",
        vec![values(
            json!({ "id": 1, "email": "legacy@example.com", "plan": "legacy", "nickname": null }),
        )],
    );
    let remult = Remult::new(provider);
    let repo = remult.repo(&accounts()).unwrap();

    // The stored plan is invalid but untouched, and the unchanged email is
    // not checked for uniqueness against itself.
    let row = repo
        .update(&json!(1), values(json!({ "nickname": "neo" })))
        .await
        .unwrap();
    assert_eq!(row.get("nickname"), &json!("neo"));

    let err = repo
        .update(&json!(1), values(json!({ "plan": "gold" })))
        .await
        .unwrap_err();
    assert!(err.validation().unwrap().field_error("plan").is_some());
}

fn coupons() -> Arc<EntityDefinition> {
    entity("coupons")
        .field("code", Fields::string())
        .field(
            "percent",
            Fields::number().validate(remult_core::validation::Validator::custom(|e| {
                match e.value.as_f64() {
                    Some(p) if p > 100.0 => Verdict::Message(format!("{p} is over 100")),
                    Some(p) if p < 0.0 => Verdict::Invalid,
                    _ => Verdict::Valid,
                }
            })),
        )
        .build()
}

#[tokio::test]
async fn custom_validators_report_their_message() {
    let remult = Remult::new(InMemoryDataProvider::new());
    let repo = remult.repo(&coupons()).unwrap();

    let err = repo
        .insert(values(json!({ "code": "BIG", "percent": 150 })))
        .await
        .unwrap_err();
    assert_eq!(
        err.validation().unwrap().field_error("percent"),
        Some("150 is over 100")
    );

    let err = repo
        .insert(values(json!({ "code": "NEG", "percent": -5 })))
        .await
        .unwrap_err();
    assert_eq!(
        err.validation().unwrap().field_error("percent"),
        Some("Invalid value")
    );

    repo.insert(values(json!({ "code": "OK", "percent": 10 })))
        .await
        .unwrap();
}
