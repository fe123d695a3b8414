//! Runs field and entity validation for one save.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    entity::EntityRow,
    error::{Result, ValidationError},
    field::FieldMetadata,
    repository::Repository,
};

use super::validators::{Rule, ValidateFieldEvent, Validator, Verdict};

/// Validate `row` before it is written.
///
/// New rows validate every column; existing rows validate changed columns
/// only. Validators of one field run in declaration order and the first
/// failure wins; failures of different fields accumulate. Conversion errors
/// recorded while decoding count as field failures. Entity-level validation
/// runs only when every field passed.
pub(crate) async fn validate_row(repo: &Repository, row: &EntityRow) -> Result<()> {
    let metadata = row.metadata().clone();
    let is_new = row.is_new();
    let is_backend = repo.is_backend();

    let mut failures: Vec<(&Arc<FieldMetadata>, String)> = Vec::new();
    for field in metadata.columns() {
        if let Some(message) = row.conversion_errors().get(&field.key) {
            failures.push((field, message.clone()));
            continue;
        }
        if !is_new && !row.was_changed(&field.key) {
            continue;
        }
        let event = ValidateFieldEvent {
            field,
            value: row.get(&field.key),
            original_value: row.original_value(&field.key),
            is_new,
            is_backend,
            row,
        };
        for validator in &field.validators {
            let verdict = match validator.check_local(&event) {
                Some(verdict) => verdict,
                None => check_with_provider(repo, validator, &event).await?,
            };
            if let Some(message) = validator.failure(verdict) {
                failures.push((field, message));
                break;
            }
        }
    }

    if let Some((first, first_message)) = failures.first() {
        let message = format!("{}: {}", first.caption, first_message);
        let field_errors: BTreeMap<String, String> = failures
            .iter()
            .map(|(f, m)| (f.key.clone(), m.clone()))
            .collect();
        tracing::debug!(
            entity = %metadata.key,
            fields = ?field_errors.keys().collect::<Vec<_>>(),
            "validation failed"
        );
        return Err(ValidationError {
            message,
            field_errors,
        }
        .into());
    }

    if let Some(validation) = &metadata.options.validation {
        validation(row)?;
    }
    Ok(())
}

/// Rules that consult the data provider; vacuously valid off the backend.
async fn check_with_provider(
    repo: &Repository,
    validator: &Validator,
    event: &ValidateFieldEvent<'_>,
) -> Result<Verdict> {
    if !event.is_backend {
        return Ok(Verdict::Valid);
    }
    match &validator.rule {
        Rule::Unique => {
            if !event.value_changed() {
                return Ok(Verdict::Valid);
            }
            let mut filter = Map::new();
            filter.insert(event.field.key.clone(), event.value.clone());
            let count = repo.count(Some(&Value::Object(filter))).await?;
            Ok(Verdict::from(count == 0))
        }
        Rule::RelationExists => {
            if event.value.is_null() {
                return Ok(Verdict::Valid);
            }
            let Some(relation) = &event.field.relation else {
                return Ok(Verdict::Valid);
            };
            let target = repo.remult()?.repo(&relation.target())?;
            let found = target.load_cached(event.value).await?;
            Ok(Verdict::from(found.is_some()))
        }
        Rule::Required | Rule::Value(_) | Rule::Event(_) => Ok(Verdict::Valid),
    }
}
