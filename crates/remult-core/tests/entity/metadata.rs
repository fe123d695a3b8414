//! Tests for src/entity/metadata.rs: ids, permissions, ordering and the
//! key-level to db-level translation.

use remult_core::{
    entity,
    entity::{ApiPermissions, EntityOptions},
    error::QueryError,
    field::{FieldOptions, IdMetadata},
    Fields, InMemoryDataProvider, Remult, RemultError, SortEntry,
};
use serde_json::json;

fn remult() -> Remult {
    Remult::new(InMemoryDataProvider::new())
}

#[test]
fn captions_and_db_names() {
    let definition = entity("orderLines")
        .db_name("order_lines")
        .field("id", Fields::integer())
        .field("unitPrice", Fields::number().db_name("unit_price"))
        .build();
    let metadata = remult().metadata(&definition).unwrap();

    assert_eq!(metadata.key, "orderLines");
    assert_eq!(metadata.db_name, "order_lines");
    assert_eq!(metadata.caption, "Order Lines");
    assert_eq!(metadata.field("unitPrice").unwrap().caption, "Unit Price");

    let filter = metadata
        .translate_filter(&json!({ "unitPrice": { "$gt": "9.5" }, "id": [1, "2"] }))
        .unwrap();
    assert_eq!(
        filter,
        json!({ "unit_price": { "$gt": 9.5 }, "id": { "$in": [1, 2] } })
    );
    assert_eq!(
        metadata.translate_sort(&[SortEntry::desc("unitPrice")]).unwrap(),
        vec![SortEntry::desc("unit_price")]
    );
}

#[test]
fn id_defaults_to_id_field_then_first_column() {
    let remult = remult();
    let with_id = entity("a")
        .field("name", Fields::string())
        .field("id", Fields::integer())
        .build();
    let without_id = entity("b")
        .field("code", Fields::string())
        .field("name", Fields::string())
        .build();

    match &remult.metadata(&with_id).unwrap().id {
        IdMetadata::Single(field) => assert_eq!(field.key, "id"),
        other => panic!("expected a single id, got {other:?}"),
    }
    match &remult.metadata(&without_id).unwrap().id {
        IdMetadata::Single(field) => assert_eq!(field.key, "code"),
        other => panic!("expected a single id, got {other:?}"),
    }
}

#[test]
fn compound_id_filters_expand_per_component() {
    let definition = entity("grades")
        .id(["student", "course"])
        .field("student", Fields::integer())
        .field("course", Fields::string())
        .field("grade", Fields::number())
        .build();
    let metadata = remult().metadata(&definition).unwrap();

    assert!(metadata.id.is_compound());
    let values = json!({ "student": 4, "course": "math", "grade": 90 });
    assert_eq!(
        metadata.get_id(values.as_object().unwrap()),
        json!("4,math")
    );
    assert_eq!(
        metadata.id_db_filter(&json!("4,math")).unwrap(),
        json!({ "$and": [{ "course": "math" }, { "student": 4 }] })
    );
    assert_eq!(
        metadata.default_order(),
        vec![SortEntry::asc("student"), SortEntry::asc("course")]
    );
}

#[test]
fn api_permissions_follow_crud_flag_and_overrides() {
    let remult = remult();
    let closed = entity("closed").field("id", Fields::integer()).build();
    assert_eq!(
        remult.metadata(&closed).unwrap().api_permissions(),
        ApiPermissions {
            read: true,
            insert: false,
            update: false,
            delete: false,
        }
    );

    let open = entity("open")
        .options(EntityOptions {
            allow_api_crud: Some(true),
            allow_api_delete: Some(false),
            ..Default::default()
        })
        .field("id", Fields::integer())
        .build();
    assert_eq!(
        remult.metadata(&open).unwrap().api_permissions(),
        ApiPermissions {
            read: true,
            insert: true,
            update: true,
            delete: false,
        }
    );
}

#[test]
fn field_api_flags() {
    let definition = entity("users")
        .field("id", Fields::auto_increment())
        .field(
            "passwordHash",
            Fields::string().with(FieldOptions {
                include_in_api: Some(false),
                ..Default::default()
            }),
        )
        .field("createdAt", Fields::created_at())
        .build();
    let metadata = remult().metadata(&definition).unwrap();

    let id = metadata.field("id").unwrap();
    assert!(id.db_read_only);
    assert!(!id.allow_api_update);
    assert_eq!(id.field_type_in_db(), Some("autoincrement"));
    assert!(!metadata.field("passwordHash").unwrap().include_in_api);
    assert!(!metadata.field("createdAt").unwrap().allow_api_update);
}

#[tokio::test]
async fn hidden_fields_are_left_out_of_the_wire_form() {
    let remult = remult();
    let definition = entity("users")
        .field("id", Fields::auto_increment())
        .field("name", Fields::string())
        .field(
            "passwordHash",
            Fields::string().with(FieldOptions {
                include_in_api: Some(false),
                ..Default::default()
            }),
        )
        .build();
    let repo = remult.repo(&definition).unwrap();
    let row = repo
        .insert(
            json!({ "name": "ada", "passwordHash": "x1" })
                .as_object()
                .unwrap()
                .clone(),
        )
        .await
        .unwrap();
    assert_eq!(row.get("passwordHash"), &json!("x1"));
    assert_eq!(repo.to_json(&row).unwrap(), json!({ "id": 1, "name": "ada" }));
}

#[test]
fn unknown_fields_in_queries() {
    let definition = entity("notes")
        .field("id", Fields::integer())
        .field("text", Fields::string())
        .build();
    let metadata = remult().metadata(&definition).unwrap();

    assert!(matches!(
        metadata.translate_filter(&json!({ "body": "x" })),
        Err(RemultError::Query(QueryError::UnknownField { field, .. })) if field == "body"
    ));
    assert!(matches!(
        metadata.translate_filter(&json!({ "$near": 1 })),
        Err(RemultError::Query(QueryError::UnknownOperator(_)))
    ));
    assert!(metadata.translate_sort(&[SortEntry::asc("body")]).is_err());
    assert!(metadata
        .translate_filter(&json!({ "$or": [{ "id": 1 }, { "text": "a" }] }))
        .is_ok());
}
