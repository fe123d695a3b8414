//! The data provider boundary.
//!
//! Providers see db names and db values only: filters, sort entries and rows
//! have already been translated by the entity metadata.

pub mod memory;

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{entity::EntityMetadata, error::Result, filter::SortEntry};

pub use memory::InMemoryDataProvider;

/// Db-level query passed to [`DataProvider::find`].
#[derive(Debug, Clone, Default)]
pub struct ProviderFindOptions {
    pub filter: Option<Value>,
    pub order_by: Vec<SortEntry>,
    pub limit: Option<usize>,
    /// 1-based page of `limit` rows.
    pub page: Option<usize>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Work grouped by [`DataProvider::transaction`].
pub type TransactionAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn find(
        &self,
        entity: &EntityMetadata,
        options: &ProviderFindOptions,
    ) -> Result<Vec<Map<String, Value>>>;

    async fn count(&self, entity: &EntityMetadata, filter: Option<&Value>) -> Result<usize>;

    /// Insert a row and return it as stored (with provider-assigned values).
    async fn insert(&self, entity: &EntityMetadata, row: Map<String, Value>)
        -> Result<Map<String, Value>>;

    /// Apply `changes` to the row with in-memory id `id`; return the stored row.
    async fn update(
        &self,
        entity: &EntityMetadata,
        id: &Value,
        changes: Map<String, Value>,
    ) -> Result<Map<String, Value>>;

    async fn delete(&self, entity: &EntityMetadata, id: &Value) -> Result<()>;

    /// Group writes. Providers without atomic grouping run the action as is.
    async fn transaction(&self, action: TransactionAction) -> Result<()> {
        action().await
    }

    /// Create whatever storage the entities need.
    async fn ensure_schema(&self, _entities: &[Arc<EntityMetadata>]) -> Result<()> {
        Ok(())
    }
}
