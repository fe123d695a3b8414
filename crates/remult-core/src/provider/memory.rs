//! In-memory data provider: rows kept per entity db name.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{
    entity::EntityMetadata,
    error::{ProviderError, Result},
    field::metadata::id_key,
    filter::{
        execute::{count_matching, execute_query},
        operators::matches_filter,
        types::page_offset,
    },
};

use super::{DataProvider, ProviderFindOptions, TransactionAction};

type Tables = HashMap<String, Vec<Map<String, Value>>>;

/// Cloning yields another handle to the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataProvider {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored rows of one table.
    pub fn rows(&self, db_name: &str) -> Vec<Map<String, Value>> {
        self.tables.lock().get(db_name).cloned().unwrap_or_default()
    }

    pub fn has_table(&self, db_name: &str) -> bool {
        self.tables.lock().contains_key(db_name)
    }

    /// Replace the stored rows of one table.
    pub fn seed(&self, db_name: &str, rows: Vec<Map<String, Value>>) {
        self.tables.lock().insert(db_name.to_string(), rows);
    }

    fn table_values(&self, db_name: &str) -> Vec<Value> {
        self.tables
            .lock()
            .get(db_name)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }
}

/// Db-level equality filter over the id columns of `row`.
fn row_id_filter(entity: &EntityMetadata, row: &Map<String, Value>) -> Value {
    let filter: Map<String, Value> = entity
        .id
        .fields()
        .iter()
        .map(|f| {
            (
                f.db_name.clone(),
                row.get(&f.db_name).cloned().unwrap_or(Value::Null),
            )
        })
        .collect();
    Value::Object(filter)
}

fn position(rows: &[Map<String, Value>], filter: &Value) -> Result<Option<usize>> {
    for (i, row) in rows.iter().enumerate() {
        if matches_filter(&Value::Object(row.clone()), filter)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

#[async_trait]
impl DataProvider for InMemoryDataProvider {
    async fn find(
        &self,
        entity: &EntityMetadata,
        options: &ProviderFindOptions,
    ) -> Result<Vec<Map<String, Value>>> {
        let records = self.table_values(&entity.db_name);
        let rows = execute_query(
            records,
            options.filter.as_ref(),
            &options.order_by,
            page_offset(options.limit, options.page),
            options.limit,
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect())
    }

    async fn count(&self, entity: &EntityMetadata, filter: Option<&Value>) -> Result<usize> {
        count_matching(&self.table_values(&entity.db_name), filter)
    }

    async fn insert(
        &self,
        entity: &EntityMetadata,
        mut row: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut tables = self.tables.lock();
        let table = tables.entry(entity.db_name.clone()).or_default();

        for field in entity.columns() {
            if field.field_type_in_db() != Some("autoincrement") {
                continue;
            }
            if !row.get(&field.db_name).map_or(true, Value::is_null) {
                continue;
            }
            let next = table
                .iter()
                .filter_map(|r| r.get(&field.db_name).and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
                + 1;
            row.insert(field.db_name.clone(), Value::from(next));
        }

        let id_filter = row_id_filter(entity, &row);
        if position(table, &id_filter)?.is_some() {
            let id = entity
                .id
                .fields()
                .iter()
                .map(|f| id_key(row.get(&f.db_name).unwrap_or(&Value::Null)))
                .collect::<Vec<_>>()
                .join(",");
            return Err(ProviderError::DuplicateId {
                entity: entity.key.clone(),
                id,
            }
            .into());
        }

        table.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        entity: &EntityMetadata,
        id: &Value,
        changes: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let filter = entity.id_db_filter(id)?;
        let mut tables = self.tables.lock();
        let table = tables.entry(entity.db_name.clone()).or_default();
        let index = position(table, &filter)?.ok_or_else(|| ProviderError::RowNotFound {
            entity: entity.key.clone(),
            id: id_key(id),
        })?;
        let row = &mut table[index];
        for (key, value) in changes {
            row.insert(key, value);
        }
        Ok(row.clone())
    }

    async fn delete(&self, entity: &EntityMetadata, id: &Value) -> Result<()> {
        let filter = entity.id_db_filter(id)?;
        let mut tables = self.tables.lock();
        let table = tables.entry(entity.db_name.clone()).or_default();
        let index = position(table, &filter)?.ok_or_else(|| ProviderError::RowNotFound {
            entity: entity.key.clone(),
            id: id_key(id),
        })?;
        table.remove(index);
        Ok(())
    }

    /// Restores the state from before the action when it fails. Writes made
    /// concurrently by other tasks during the action are rolled back too.
    async fn transaction(&self, action: TransactionAction) -> Result<()> {
        let snapshot = self.tables.lock().clone();
        match action().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "rolling back in-memory transaction");
                *self.tables.lock() = snapshot;
                Err(e)
            }
        }
    }

    async fn ensure_schema(&self, entities: &[Arc<EntityMetadata>]) -> Result<()> {
        let mut tables = self.tables.lock();
        for entity in entities {
            tables.entry(entity.db_name.clone()).or_default();
        }
        Ok(())
    }
}
