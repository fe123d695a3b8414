//! Persistence of stored live queries.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;

use super::{now_iso, LiveQueryOptions, StoredQuery};

#[async_trait]
pub trait LiveQueryStorage: Send + Sync {
    /// Register `query`, replacing any query with the same id.
    async fn add(&self, query: StoredQuery) -> Result<()>;

    /// Forget `query_id`. Unknown ids are ignored.
    async fn remove(&self, query_id: &str) -> Result<()>;

    /// Live queries of `entity_key`. Stale queries are purged on the way and
    /// never returned.
    async fn live_queries(&self, entity_key: &str) -> Result<Vec<StoredQuery>>;

    /// Replace the stored data of `query_id`.
    async fn set_data(&self, query_id: &str, data: Value) -> Result<()>;

    /// Refresh the last-used time of every known id and return the others.
    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        query_ids: &[String],
    ) -> Result<Vec<String>>;

    /// Create whatever storage the queries need.
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }
}

/// Stored queries kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLiveQueryStorage {
    queries: Mutex<Vec<StoredQuery>>,
    options: LiveQueryOptions,
}

impl InMemoryLiveQueryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LiveQueryOptions) -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Copy of every stored query, stale ones included.
    pub fn queries(&self) -> Vec<StoredQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl LiveQueryStorage for InMemoryLiveQueryStorage {
    async fn add(&self, query: StoredQuery) -> Result<()> {
        let mut queries = self.queries.lock();
        queries.retain(|q| q.id != query.id);
        queries.push(query);
        Ok(())
    }

    async fn remove(&self, query_id: &str) -> Result<()> {
        self.queries.lock().retain(|q| q.id != query_id);
        Ok(())
    }

    async fn live_queries(&self, entity_key: &str) -> Result<Vec<StoredQuery>> {
        let now = Utc::now();
        let mut queries = self.queries.lock();
        let before = queries.len();
        queries.retain(|q| q.entity_key != entity_key || !self.options.is_stale(q, now));
        let purged = before - queries.len();
        if purged > 0 {
            tracing::debug!(entity = %entity_key, purged, "purged stale live queries");
        }
        Ok(queries
            .iter()
            .filter(|q| q.entity_key == entity_key)
            .cloned()
            .collect())
    }

    async fn set_data(&self, query_id: &str, data: Value) -> Result<()> {
        if let Some(query) = self.queries.lock().iter_mut().find(|q| q.id == query_id) {
            query.data = data;
        }
        Ok(())
    }

    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        query_ids: &[String],
    ) -> Result<Vec<String>> {
        let now = now_iso();
        let mut queries = self.queries.lock();
        let mut unknown = Vec::new();
        for id in query_ids {
            match queries.iter_mut().find(|q| &q.id == id) {
                Some(query) => query.last_used_iso = now.clone(),
                None => unknown.push(id.clone()),
            }
        }
        Ok(unknown)
    }
}
