//! Repository: typed CRUD over one entity.
//!
//! A repository converts between in-memory rows and the db-level maps its
//! [`DataProvider`] stores, runs validation and saving hooks, keeps the
//! identity cache used by relation lookups, and reports every write to the
//! live-query server when one is configured.

mod cache;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    context::{Remult, RemultInner},
    entity::{EntityMetadata, EntityRow, Related},
    error::{ConfigurationError, RemultError, Result, ValidationError},
    field::{metadata::id_key, FieldSavingEvent, IdMetadata, ValueType},
    filter::SortEntry,
    live_query::ItemChange,
    provider::{DataProvider, ProviderFindOptions},
    relation::{LookupColumn, LookupState, OneToMany, RelationKind, RelationValue},
    validation::engine::validate_row,
};

use cache::IdentityCache;

// ============================================================================
// Options
// ============================================================================

/// Key-level query accepted by [`Repository::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Option<Value>,
    /// Defaults to the entity's default order.
    pub order_by: Option<Vec<SortEntry>>,
    pub limit: Option<usize>,
    /// 1-based page of `limit` rows.
    pub page: Option<usize>,
    /// Relation fields to load onto every returned row.
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct FindIdOptions {
    /// Return a new unsaved row carrying the id instead of failing.
    pub create_if_not_found: bool,
    /// Answer from the identity cache when possible.
    pub use_cache: bool,
}

impl Default for FindIdOptions {
    fn default() -> Self {
        Self {
            create_if_not_found: false,
            use_cache: true,
        }
    }
}

/// Outcome of [`Repository::insert_many`]: the rows that were saved and the
/// input index of every item that failed.
#[derive(Debug, Default)]
pub struct BatchInsertResult {
    pub rows: Vec<EntityRow>,
    pub errors: Vec<(usize, RemultError)>,
}

// ============================================================================
// Repository
// ============================================================================

struct RepositoryInner {
    metadata: Arc<EntityMetadata>,
    provider: Arc<dyn DataProvider>,
    context: Weak<RemultInner>,
    cache: IdentityCache,
}

/// Cloning yields another handle to the same repository and cache.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &self.inner.metadata.key)
            .finish()
    }
}

/// Non-owning handle held by relation lookups.
#[derive(Clone)]
pub struct WeakRepository {
    inner: Weak<RepositoryInner>,
    entity_key: String,
}

impl WeakRepository {
    pub fn upgrade(&self) -> Option<Repository> {
        self.inner.upgrade().map(|inner| Repository { inner })
    }

    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }
}

impl Repository {
    pub(crate) fn new(
        metadata: Arc<EntityMetadata>,
        provider: Arc<dyn DataProvider>,
        context: Weak<RemultInner>,
    ) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                metadata,
                provider,
                context,
                cache: IdentityCache::default(),
            }),
        }
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.inner.metadata
    }

    pub fn downgrade(&self) -> WeakRepository {
        WeakRepository {
            inner: Arc::downgrade(&self.inner),
            entity_key: self.inner.metadata.key.clone(),
        }
    }

    /// The owning context.
    pub fn remult(&self) -> Result<Remult> {
        self.inner
            .context
            .upgrade()
            .map(Remult::from_inner)
            .ok_or_else(|| {
                RemultError::Internal(format!(
                    "context of repository \"{}\" was dropped",
                    self.inner.metadata.key
                ))
            })
    }

    /// Whether provider-backed validation runs (unique, relation exists).
    pub fn is_backend(&self) -> bool {
        self.inner
            .context
            .upgrade()
            .map_or(true, |context| context.options.backend)
    }

    fn has_live_query(&self) -> bool {
        self.inner
            .context
            .upgrade()
            .is_some_and(|context| context.options.live_query.is_some())
    }

    fn notify(&self, change: ItemChange) {
        if let Some(context) = self.inner.context.upgrade() {
            context.item_changed(change);
        }
    }

    // ------------------------------------------------------------------------
    // Hydration
    // ------------------------------------------------------------------------

    fn new_lookups(&self) -> Result<BTreeMap<String, LookupColumn>> {
        let metadata = self.metadata();
        if !metadata.columns().any(|f| f.is_lookup()) {
            return Ok(BTreeMap::new());
        }
        let remult = self.remult()?;
        let mut lookups = BTreeMap::new();
        for field in metadata.columns() {
            let Some(relation) = field.relation.as_ref().filter(|_| field.is_lookup()) else {
                continue;
            };
            let target = remult.repo(&relation.target())?;
            let id_type = match &target.metadata().id {
                IdMetadata::Single(id) => id.value_type,
                IdMetadata::Compound(_) => ValueType::String,
            };
            lookups.insert(
                field.key.clone(),
                LookupColumn::new(
                    target.downgrade(),
                    id_type,
                    field.is_reference(),
                    field.allow_null,
                ),
            );
        }
        Ok(lookups)
    }

    /// Row over in-memory `values`; `persisted` rows snapshot them as their
    /// original state.
    fn build_row(&self, mut values: Map<String, Value>, persisted: bool) -> Result<EntityRow> {
        let mut lookups = self.new_lookups()?;
        for (key, lookup) in lookups.iter_mut() {
            lookup.restore(values.get(key).cloned().unwrap_or(Value::Null));
            values.insert(key.clone(), lookup.id());
        }
        let original = persisted.then(|| values.clone());
        Ok(EntityRow::new(
            self.metadata().clone(),
            values,
            original,
            lookups,
        ))
    }

    /// Decode a stored row. Values that fail to decode are kept raw and
    /// recorded as conversion errors on the row.
    fn hydrate(&self, stored: Map<String, Value>) -> Result<EntityRow> {
        let mut values = Map::new();
        let mut errors = Vec::new();
        for field in self.metadata().columns() {
            let raw = stored.get(&field.db_name).cloned().unwrap_or(Value::Null);
            match field.from_db(&raw) {
                Ok(value) => {
                    values.insert(field.key.clone(), value);
                }
                Err(e) => {
                    errors.push((field.key.clone(), e.message));
                    values.insert(field.key.clone(), raw);
                }
            }
        }
        let mut row = self.build_row(values, true)?;
        for (key, message) in errors {
            tracing::warn!(entity = %self.metadata().key, field = %key, error = %message, "failed to decode stored value");
            row.record_conversion_error(&key, message);
        }
        Ok(row)
    }

    /// A new unsaved row. Fields absent from `values` take their default.
    pub fn create(&self, values: Map<String, Value>) -> Result<EntityRow> {
        let initial: Map<String, Value> = self
            .metadata()
            .columns()
            .filter(|f| !values.contains_key(&f.key))
            .map(|f| (f.key.clone(), f.initial_value()))
            .collect();
        let mut row = self.build_row(initial, false)?;
        row.assign(&values)?;
        Ok(row)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    async fn fetch_rows(&self, options: &FindOptions) -> Result<Vec<EntityRow>> {
        let metadata = self.metadata();
        let filter = match &options.filter {
            Some(filter) if !filter.is_null() => Some(metadata.translate_filter(filter)?),
            _ => None,
        };
        let order_by = match &options.order_by {
            Some(order) => metadata.translate_sort(order)?,
            None => metadata.translate_sort(&metadata.default_order())?,
        };
        let query = ProviderFindOptions {
            filter,
            order_by,
            limit: options.limit,
            page: options.page,
        };
        let stored = self.inner.provider.find(metadata, &query).await?;
        let rows = stored
            .into_iter()
            .map(|r| self.hydrate(r))
            .collect::<Result<Vec<_>>>()?;
        self.resolve_value_relations(&rows).await?;
        Ok(rows)
    }

    /// Warm the target caches for every non-lazy value relation, one fetch
    /// per distinct id.
    async fn resolve_value_relations(&self, rows: &[EntityRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for field in self.metadata().columns() {
            let Some(relation) = &field.relation else {
                continue;
            };
            if relation.kind != RelationKind::Value || relation.lazy {
                continue;
            }
            let ids = distinct(rows.iter().filter_map(|row| {
                match row.lookup(&field.key).map(|l| l.state()) {
                    Some(LookupState::IdOnly(id)) => Some(id.clone()),
                    _ => None,
                }
            }));
            if ids.is_empty() {
                continue;
            }
            let target = self.remult()?.repo(&relation.target())?;
            for id in &ids {
                target.load_cached(id).await?;
            }
        }
        Ok(())
    }

    pub async fn find(&self, options: FindOptions) -> Result<Vec<EntityRow>> {
        let mut rows = self.fetch_rows(&options).await?;
        for key in &options.include {
            self.load_relations(&mut rows, key).await?;
        }
        tracing::debug!(entity = %self.metadata().key, rows = rows.len(), "find");
        Ok(rows)
    }

    pub async fn find_first(&self, options: FindOptions) -> Result<Option<EntityRow>> {
        let rows = self
            .find(FindOptions {
                limit: Some(1),
                page: None,
                ..options
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn count(&self, filter: Option<&Value>) -> Result<usize> {
        let filter = match filter {
            Some(filter) if !filter.is_null() => Some(self.metadata().translate_filter(filter)?),
            _ => None,
        };
        self.inner.provider.count(self.metadata(), filter.as_ref()).await
    }

    async fn fetch_by_id(&self, id: &Value) -> Result<Option<EntityRow>> {
        let metadata = self.metadata();
        let query = ProviderFindOptions {
            filter: Some(metadata.id_db_filter(id)?),
            limit: Some(1),
            ..Default::default()
        };
        let stored = self.inner.provider.find(metadata, &query).await?;
        stored.into_iter().next().map(|r| self.hydrate(r)).transpose()
    }

    pub async fn find_id(&self, id: &Value, options: FindIdOptions) -> Result<EntityRow> {
        let found = if options.use_cache {
            self.load_cached(id).await?
        } else {
            let found = self.fetch_by_id(id).await?;
            if let Some(row) = &found {
                self.add_to_cache(row.clone());
            }
            found
        };
        match found {
            Some(row) => {
                self.resolve_value_relations(std::slice::from_ref(&row))
                    .await?;
                Ok(row)
            }
            None if options.create_if_not_found => {
                let values = match &self.metadata().id {
                    IdMetadata::Single(field) => {
                        let mut values = Map::new();
                        values.insert(field.key.clone(), field.converter.from_json(id)?);
                        values
                    }
                    IdMetadata::Compound(compound) => compound.parse_id(id)?,
                };
                self.create(values)
            }
            None => Err(RemultError::NotFound {
                entity: self.metadata().key.clone(),
                id: id_key(id),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Identity cache
    // ------------------------------------------------------------------------

    /// Cached resolution of `id`: `Some(None)` when known to be missing,
    /// `None` when never loaded or still loading.
    pub fn cached(&self, id: &Value) -> Option<Option<EntityRow>> {
        self.inner.cache.peek(&id_key(id))
    }

    /// Resolve `id` through the identity cache. Concurrent callers for the
    /// same id share a single provider fetch.
    pub async fn load_cached(&self, id: &Value) -> Result<Option<EntityRow>> {
        let cell = self.inner.cache.cell(&id_key(id));
        let found = cell.get_or_try_init(|| self.fetch_by_id(id)).await?;
        Ok(found.clone())
    }

    /// Store a persisted row in the identity cache. Unsaved rows are ignored.
    pub fn add_to_cache(&self, row: EntityRow) {
        if row.is_new() {
            return;
        }
        self.inner.cache.put(row.id_key(), Some(row));
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    // ------------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------------

    /// Load relation `key` onto `row`.
    pub async fn load_relation(&self, row: &mut EntityRow, key: &str) -> Result<()> {
        self.load_relations(std::slice::from_mut(row), key).await
    }

    /// The many side of relation `key` for `row`.
    pub fn to_many(&self, row: &EntityRow, key: &str) -> Result<OneToMany> {
        let (target, kind) = self.relation_target(key)?;
        match kind {
            RelationKind::ToMany { field } => Ok(OneToMany::new(target, field, row.id())),
            _ => Err(self.relation_error(key, "is not a to-many relation")),
        }
    }

    fn relation_error(&self, key: &str, message: &str) -> RemultError {
        ConfigurationError::Relation {
            entity: self.metadata().key.clone(),
            field: key.to_string(),
            message: message.to_string(),
        }
        .into()
    }

    fn relation_target(&self, key: &str) -> Result<(Repository, RelationKind)> {
        let field = self.metadata().require_field(key)?;
        let relation = field
            .relation
            .as_ref()
            .ok_or_else(|| self.relation_error(key, "is not a relation"))?;
        let target = self.remult()?.repo(&relation.target())?;
        Ok((target, relation.kind.clone()))
    }

    /// Load relation `key` for all `rows` with one query.
    async fn load_relations(&self, rows: &mut [EntityRow], key: &str) -> Result<()> {
        let (target, kind) = self.relation_target(key)?;
        match kind {
            RelationKind::Value | RelationKind::ToOne => {
                let ids = distinct(rows.iter().filter_map(|row| {
                    match row.lookup(key).map(|l| l.state()) {
                        Some(LookupState::IdOnly(id)) => Some(id.clone()),
                        Some(LookupState::Materialized { id, .. }) => Some(id.clone()),
                        _ => None,
                    }
                }));
                let found = target.find_by_ids(&ids).await?;
                for row in rows.iter_mut() {
                    if let Some(item) = found.get(&id_key(row.get(key))) {
                        row.set_related(key, RelationValue::Row(item.clone()))?;
                    }
                }
            }
            RelationKind::ToOneBy { field } => {
                let ids = distinct(
                    rows.iter()
                        .map(|row| row.get(&field).clone())
                        .filter(|id| !id.is_null()),
                );
                let found = target.find_by_ids(&ids).await?;
                for row in rows.iter_mut() {
                    let item = found.get(&id_key(row.get(&field))).cloned();
                    row.set_loaded(key, Related::One(item));
                }
            }
            RelationKind::ToMany { field } => {
                let owners = distinct(rows.iter().map(EntityRow::id));
                let mut grouped: HashMap<String, Vec<EntityRow>> = HashMap::new();
                if !owners.is_empty() {
                    let mut filter = Map::new();
                    filter.insert(field.clone(), serde_json::json!({ "$in": owners }));
                    let items = target
                        .fetch_rows(&FindOptions {
                            filter: Some(Value::Object(filter)),
                            ..Default::default()
                        })
                        .await?;
                    for item in items {
                        grouped
                            .entry(id_key(item.get(&field)))
                            .or_default()
                            .push(item);
                    }
                }
                for row in rows.iter_mut() {
                    let items = grouped.get(&row.id_key()).cloned().unwrap_or_default();
                    row.set_loaded(key, Related::Many(items));
                }
            }
        }
        Ok(())
    }

    /// Rows with the given ids, keyed by id; found rows also fill the cache.
    async fn find_by_ids(&self, ids: &[Value]) -> Result<HashMap<String, EntityRow>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = self.metadata().id.ids_filter(ids)?;
        let rows = self
            .fetch_rows(&FindOptions {
                filter: Some(filter),
                ..Default::default()
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                self.add_to_cache(row.clone());
                (row.id_key(), row)
            })
            .collect())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn insert(&self, values: Map<String, Value>) -> Result<EntityRow> {
        let mut row = self.create(values)?;
        self.save(&mut row).await?;
        Ok(row)
    }

    /// Insert every item in order. A failing item does not stop the rest.
    pub async fn insert_many(&self, items: Vec<Map<String, Value>>) -> BatchInsertResult {
        let mut result = BatchInsertResult::default();
        for (index, values) in items.into_iter().enumerate() {
            match self.insert(values).await {
                Ok(row) => result.rows.push(row),
                Err(e) => result.errors.push((index, e)),
            }
        }
        result
    }

    pub async fn insert_typed<T: Serialize>(&self, item: &T) -> Result<EntityRow> {
        match serde_json::to_value(item)? {
            Value::Object(values) => self.insert(values).await,
            other => Err(RemultError::Internal(format!(
                "expected an object for {}, received {other}",
                self.metadata().key
            ))),
        }
    }

    /// Apply `changes` to the stored row with `id` and save it.
    pub async fn update(&self, id: &Value, changes: Map<String, Value>) -> Result<EntityRow> {
        let mut row = self
            .find_id(
                id,
                FindIdOptions {
                    use_cache: false,
                    ..Default::default()
                },
            )
            .await?;
        row.assign(&changes)?;
        self.save(&mut row).await?;
        Ok(row)
    }

    /// Validate and write `row`: inserted when new, otherwise only changed
    /// columns are written under the row's original id. On success the row
    /// adopts the stored state.
    pub async fn save(&self, row: &mut EntityRow) -> Result<()> {
        let metadata = self.metadata().clone();
        if row.metadata().key != metadata.key {
            return Err(RemultError::Internal(format!(
                "row of \"{}\" saved through repository of \"{}\"",
                row.metadata().key,
                metadata.key
            )));
        }
        let is_new = row.is_new();

        validate_row(self, row).await?;

        for field in metadata.columns() {
            if let Some(saving) = &field.saving {
                let mut value = row.get(&field.key).clone();
                saving(&mut value, FieldSavingEvent { is_new });
                if &value != row.get(&field.key) {
                    row.set(&field.key, value)?;
                }
            }
        }
        if let Some(saving) = &metadata.options.saving {
            saving(&mut *row, is_new)?;
        }

        let mut stored_values = Map::new();
        let mut failures = BTreeMap::new();
        let mut first_failure = None;
        for field in metadata.columns() {
            if field.db_read_only || (!is_new && !row.was_changed(&field.key)) {
                continue;
            }
            match field.to_db(row.get(&field.key)) {
                Ok(value) => {
                    stored_values.insert(field.db_name.clone(), value);
                }
                Err(e) => {
                    first_failure
                        .get_or_insert_with(|| format!("{}: {}", field.caption, e.message));
                    failures.insert(field.key.clone(), e.message);
                }
            }
        }
        if let Some(message) = first_failure {
            return Err(ValidationError {
                message,
                field_errors: failures,
            }
            .into());
        }

        let old_id = row.original_id();
        let stored = match &old_id {
            None => {
                self.inner
                    .provider
                    .insert(&metadata, stored_values)
                    .await?
            }
            Some(_) if stored_values.is_empty() => return Ok(()),
            Some(id) => {
                self.inner
                    .provider
                    .update(&metadata, id, stored_values)
                    .await?
            }
        };
        let fresh = self.hydrate(stored)?;
        row.refresh_from(fresh);

        if let Some(old) = &old_id {
            if id_key(old) != row.id_key() {
                self.inner.cache.remove(&id_key(old));
            }
        }
        self.add_to_cache(row.clone());
        tracing::debug!(entity = %metadata.key, id = %row.id_key(), is_new, "saved");

        if self.has_live_query() {
            match self.to_json(row) {
                Ok(item) => self.notify(ItemChange {
                    entity_key: metadata.key.clone(),
                    id: row.id(),
                    old_id: old_id.unwrap_or_else(|| row.id()),
                    deleted: false,
                    values: Some(row.to_value()),
                    item: Some(item),
                }),
                Err(e) => {
                    tracing::warn!(entity = %metadata.key, error = %e, "failed to encode live query item")
                }
            }
        }
        Ok(())
    }

    /// Delete the stored row with `id`.
    pub async fn delete(&self, id: &Value) -> Result<()> {
        let row = self
            .find_id(
                id,
                FindIdOptions {
                    use_cache: false,
                    ..Default::default()
                },
            )
            .await?;
        self.delete_row(&row).await
    }

    pub async fn delete_row(&self, row: &EntityRow) -> Result<()> {
        let metadata = self.metadata();
        let id = row.original_id().ok_or_else(|| {
            RemultError::Internal(format!("cannot delete an unsaved {} row", metadata.key))
        })?;
        if let Some(deleting) = &metadata.options.deleting {
            deleting(row)?;
        }
        self.inner.provider.delete(metadata, &id).await?;
        self.inner.cache.remove(&id_key(&id));
        tracing::debug!(entity = %metadata.key, id = %id_key(&id), "deleted");

        if self.has_live_query() {
            self.notify(ItemChange {
                entity_key: metadata.key.clone(),
                id: id.clone(),
                old_id: id,
                deleted: true,
                values: None,
                item: None,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------------

    /// Wire form of `row`: fields keyed by field key, values encoded by each
    /// field's converter. Fields hidden from the API are left out.
    pub fn to_json(&self, row: &EntityRow) -> Result<Value> {
        let mut out = Map::new();
        for field in self.metadata().fields() {
            if !field.include_in_api {
                continue;
            }
            if field.is_column() {
                let value = match row.lookup(&field.key).and_then(LookupColumn::to_json) {
                    Some(value) => value,
                    None => field.converter.to_json(row.get(&field.key))?,
                };
                out.insert(field.key.clone(), value);
            } else if let Some(items) = row.related_many(&field.key) {
                let items = items.iter().map(|r| Value::Object(r.to_value())).collect();
                out.insert(field.key.clone(), Value::Array(items));
            } else if let Some(item) = row.related_one(&field.key) {
                out.insert(field.key.clone(), Value::Object(item.to_value()));
            }
        }
        Ok(Value::Object(out))
    }

    /// Row from its wire form. Values that fail to decode are kept raw and
    /// recorded as conversion errors, so the next save reports them.
    pub fn from_json(&self, json: &Value, is_new: bool) -> Result<EntityRow> {
        let obj = json.as_object().ok_or_else(|| {
            RemultError::Internal(format!(
                "expected an object for {}, received {json}",
                self.metadata().key
            ))
        })?;

        let mut values = Map::new();
        let mut errors = Vec::new();
        let mut items = Vec::new();
        for field in self.metadata().columns() {
            let Some(raw) = obj.get(&field.key) else {
                if is_new {
                    values.insert(field.key.clone(), field.initial_value());
                }
                continue;
            };
            if let (Some(relation), Value::Object(_)) = (&field.relation, raw) {
                let target = self.remult()?.repo(&relation.target())?;
                let item = target.from_json(raw, false)?;
                values.insert(field.key.clone(), item.id());
                items.push((field.key.clone(), item));
                continue;
            }
            match field.converter.from_json(raw) {
                Ok(value) => {
                    values.insert(field.key.clone(), value);
                }
                Err(e) => {
                    errors.push((field.key.clone(), e.message));
                    values.insert(field.key.clone(), raw.clone());
                }
            }
        }

        let mut row = self.build_row(values, !is_new)?;
        for (key, item) in items {
            row.set_related(&key, RelationValue::Row(item))?;
        }
        for (key, message) in errors {
            row.record_conversion_error(&key, message);
        }
        Ok(row)
    }
}

/// Values deduplicated by id key, first occurrence kept.
fn distinct(ids: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    ids.filter(|id| seen.insert(id_key(id))).collect()
}
