//! EntityRow: one hydrated entity instance.

use std::{collections::BTreeMap, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{QueryError, RemultError, Result},
    field::metadata::id_key,
    filter::operators::deep_equals,
    relation::{LookupColumn, RelationValue},
};

use super::metadata::EntityMetadata;

/// A non-column relation loaded onto a row.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<EntityRow>),
    Many(Vec<EntityRow>),
}

/// In-memory values of one entity, keyed by field key.
///
/// Relation columns keep their id in `values` and their resolution state in a
/// [`LookupColumn`]; the two are always updated together.
#[derive(Clone)]
pub struct EntityRow {
    metadata: Arc<EntityMetadata>,
    values: Map<String, Value>,
    /// Values as last persisted; `None` for rows never saved.
    original: Option<Map<String, Value>>,
    lookups: BTreeMap<String, LookupColumn>,
    related: BTreeMap<String, Related>,
    conversion_errors: BTreeMap<String, String>,
}

impl std::fmt::Debug for EntityRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRow")
            .field("entity", &self.metadata.key)
            .field("values", &self.values)
            .field("is_new", &self.is_new())
            .field("lookups", &self.lookups)
            .field("related", &self.related)
            .finish()
    }
}

impl EntityRow {
    pub(crate) fn new(
        metadata: Arc<EntityMetadata>,
        values: Map<String, Value>,
        original: Option<Map<String, Value>>,
        lookups: BTreeMap<String, LookupColumn>,
    ) -> Self {
        Self {
            metadata,
            values,
            original,
            lookups,
            related: BTreeMap::new(),
            conversion_errors: BTreeMap::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    /// Value of a column field (relation columns yield the related id).
    pub fn get(&self, key: &str) -> &Value {
        self.values.get(key).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self.metadata.require_field(key)?;
        if !field.is_column() {
            return Err(QueryError::UnknownField {
                entity: self.metadata.key.clone(),
                field: key.to_string(),
            }
            .into());
        }
        if let Some(lookup) = self.lookups.get_mut(key) {
            lookup.set(RelationValue::from(value));
            self.values.insert(key.to_string(), lookup.id());
        } else {
            self.values.insert(key.to_string(), value);
        }
        self.conversion_errors.remove(key);
        Ok(())
    }

    /// Set a relation column from an id, a related row, or null.
    pub fn set_related(&mut self, key: &str, value: impl Into<RelationValue>) -> Result<()> {
        let entity = self.metadata.key.clone();
        let lookup = self.lookups.get_mut(key).ok_or_else(|| {
            RemultError::from(QueryError::UnknownField {
                entity,
                field: key.to_string(),
            })
        })?;
        lookup.set(value.into());
        self.values.insert(key.to_string(), lookup.id());
        Ok(())
    }

    /// Copy every known key of `values` onto the row.
    pub fn assign(&mut self, values: &Map<String, Value>) -> Result<()> {
        for (key, value) in values {
            self.set(key, value.clone())?;
        }
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<&LookupColumn> {
        self.lookups.get(key)
    }

    pub fn lookup_mut(&mut self, key: &str) -> Option<&mut LookupColumn> {
        self.lookups.get_mut(key)
    }

    /// The related row of a one-to-one relation, when loaded.
    pub fn related_one(&self, key: &str) -> Option<&EntityRow> {
        if let Some(lookup) = self.lookups.get(key) {
            return lookup.item();
        }
        match self.related.get(key) {
            Some(Related::One(row)) => row.as_ref(),
            _ => None,
        }
    }

    /// The related rows of a one-to-many relation, when loaded.
    pub fn related_many(&self, key: &str) -> Option<&[EntityRow]> {
        match self.related.get(key) {
            Some(Related::Many(rows)) => Some(rows),
            _ => None,
        }
    }

    pub(crate) fn set_loaded(&mut self, key: &str, related: Related) {
        self.related.insert(key.to_string(), related);
    }

    /// Logical id (compound ids render as `"a,b"`).
    pub fn id(&self) -> Value {
        self.metadata.get_id(&self.values)
    }

    pub fn id_key(&self) -> String {
        id_key(&self.id())
    }

    /// Id under which the row is persisted; differs from [`EntityRow::id`]
    /// while an id change is unsaved.
    pub fn original_id(&self) -> Option<Value> {
        self.original.as_ref().map(|o| self.metadata.get_id(o))
    }

    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    pub fn was_changed(&self, key: &str) -> bool {
        match &self.original {
            None => true,
            Some(original) => !deep_equals(
                original.get(key).unwrap_or(&Value::Null),
                self.get(key),
            ),
        }
    }

    /// Column keys whose value differs from the persisted snapshot.
    pub fn changed_fields(&self) -> Vec<String> {
        self.metadata
            .columns()
            .filter(|f| self.was_changed(&f.key))
            .map(|f| f.key.clone())
            .collect()
    }

    pub fn original_value(&self, key: &str) -> Option<&Value> {
        self.original.as_ref().and_then(|o| o.get(key))
    }

    /// Column values keyed by field key.
    pub fn to_value(&self) -> Map<String, Value> {
        self.metadata
            .columns()
            .map(|f| (f.key.clone(), self.get(&f.key).clone()))
            .collect()
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.to_value()))?)
    }

    pub fn from_typed<T: Serialize>(&mut self, item: &T) -> Result<()> {
        match serde_json::to_value(item)? {
            Value::Object(values) => self.assign(&values),
            other => Err(RemultError::Internal(format!(
                "expected an object for {}, received {other}",
                self.metadata.key
            ))),
        }
    }

    pub fn conversion_errors(&self) -> &BTreeMap<String, String> {
        &self.conversion_errors
    }

    pub(crate) fn record_conversion_error(&mut self, key: &str, message: String) {
        self.conversion_errors.insert(key.to_string(), message);
    }

    /// Adopt a freshly persisted state. Materialized lookups whose id did not
    /// change are kept.
    pub(crate) fn refresh_from(&mut self, mut fresh: EntityRow) {
        for (key, lookup) in std::mem::take(&mut self.lookups) {
            let keep = lookup.item().is_some()
                && fresh
                    .lookups
                    .get(&key)
                    .is_some_and(|f| deep_equals(&f.id(), &lookup.id()));
            if keep {
                fresh.lookups.insert(key, lookup);
            }
        }
        fresh.related = std::mem::take(&mut self.related);
        *self = fresh;
    }
}
