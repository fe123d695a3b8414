//! Stored live queries persisted through a data provider, so that several
//! server processes sharing a database see the same subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    context::{Remult, RemultOptions},
    entity::{entity, EntityDefinition, EntityRow},
    error::Result,
    field::Fields,
    provider::DataProvider,
    repository::{FindIdOptions, FindOptions, Repository},
};

use super::{now_iso, storage::LiveQueryStorage, LiveQueryOptions, StoredQuery};

pub const STORAGE_DB_NAME: &str = "remult_live_query_storage";

fn storage_entity() -> Arc<EntityDefinition> {
    entity("live_query_storage")
        .db_name(STORAGE_DB_NAME)
        .field("id", Fields::string())
        .field("entityKey", Fields::string())
        .field("data", Fields::object())
        .field("lastUsedIso", Fields::string())
        .build()
}

fn to_stored(row: &EntityRow) -> StoredQuery {
    let text = |key: &str| row.get(key).as_str().unwrap_or_default().to_string();
    StoredQuery {
        id: text("id"),
        entity_key: text("entityKey"),
        data: row.get("data").clone(),
        last_used_iso: text("lastUsedIso"),
    }
}

pub struct DataProviderLiveQueryStorage {
    /// Private backend context; keeps the repository alive.
    remult: Remult,
    repo: Repository,
    options: LiveQueryOptions,
}

impl std::fmt::Debug for DataProviderLiveQueryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProviderLiveQueryStorage")
            .field("db_name", &STORAGE_DB_NAME)
            .field("options", &self.options)
            .finish()
    }
}

impl DataProviderLiveQueryStorage {
    pub fn new(provider: Arc<dyn DataProvider>) -> Result<Self> {
        Self::with_options(provider, LiveQueryOptions::default())
    }

    pub fn with_options(provider: Arc<dyn DataProvider>, options: LiveQueryOptions) -> Result<Self> {
        let remult = Remult::with_options(provider, RemultOptions::default());
        let repo = remult.repo(&storage_entity())?;
        Ok(Self {
            remult,
            repo,
            options,
        })
    }
}

#[async_trait]
impl LiveQueryStorage for DataProviderLiveQueryStorage {
    async fn add(&self, query: StoredQuery) -> Result<()> {
        let mut row = self
            .repo
            .find_id(
                &Value::String(query.id.clone()),
                FindIdOptions {
                    create_if_not_found: true,
                    use_cache: false,
                },
            )
            .await?;
        row.set("entityKey", query.entity_key)?;
        row.set("data", query.data)?;
        row.set("lastUsedIso", query.last_used_iso)?;
        self.repo.save(&mut row).await
    }

    async fn remove(&self, query_id: &str) -> Result<()> {
        match self.repo.delete(&Value::String(query_id.to_string())).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn live_queries(&self, entity_key: &str) -> Result<Vec<StoredQuery>> {
        let rows = self
            .repo
            .find(FindOptions {
                filter: Some(json!({ "entityKey": entity_key })),
                ..Default::default()
            })
            .await?;
        let now = Utc::now();
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            let query = to_stored(&row);
            if !self.options.is_stale(&query, now) {
                live.push(query);
                continue;
            }
            if let Err(e) = self.repo.delete_row(&row).await {
                tracing::warn!(query_id = %query.id, error = %e, "failed to purge stale live query");
            }
        }
        Ok(live)
    }

    async fn set_data(&self, query_id: &str, data: Value) -> Result<()> {
        let mut changes = Map::new();
        changes.insert("data".to_string(), data);
        self.repo
            .update(&Value::String(query_id.to_string()), changes)
            .await?;
        Ok(())
    }

    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        query_ids: &[String],
    ) -> Result<Vec<String>> {
        let rows = self
            .repo
            .find(FindOptions {
                filter: Some(json!({ "id": query_ids })),
                ..Default::default()
            })
            .await?;
        let now = now_iso();
        let mut unknown = query_ids.to_vec();
        for mut row in rows {
            row.set("lastUsedIso", now.clone())?;
            self.repo.save(&mut row).await?;
            let id = to_stored(&row).id;
            unknown.retain(|q| q != &id);
        }
        Ok(unknown)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let metadata = self.repo.metadata().clone();
        self.remult.provider().ensure_schema(&[metadata]).await
    }
}
