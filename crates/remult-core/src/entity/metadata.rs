//! EntityMetadata: the frozen descriptor derived from an `EntityDefinition`.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    context::Remult,
    error::{ConfigurationError, QueryError, RemultError, Result},
    field::{
        builder::{make_title, resolve_field_options, validate_name},
        CompoundIdField, FieldMetadata, IdMetadata,
    },
    filter::{
        operators::{is_operator, sub_filters, LIST_OPERATORS, TEXT_OPERATORS},
        SortEntry,
    },
    relation::RelationKind,
};

use super::definition::{EntityDefinition, EntityOptions};

/// API permissions declared on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiPermissions {
    pub read: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

pub struct EntityMetadata {
    pub key: String,
    pub db_name: String,
    pub caption: String,
    pub id: IdMetadata,
    pub options: EntityOptions,
    fields: Vec<Arc<FieldMetadata>>,
    by_key: HashMap<String, usize>,
}

impl std::fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("key", &self.key)
            .field("db_name", &self.db_name)
            .field("caption", &self.caption)
            .field("id", &self.id)
            .field("fields", &self.fields)
            .finish()
    }
}

impl EntityMetadata {
    pub(crate) fn build(definition: &EntityDefinition, remult: &Remult) -> Result<Self> {
        validate_name(&definition.key)?;
        if definition.fields.is_empty() {
            return Err(ConfigurationError::NoFields(definition.key.clone()).into());
        }

        let mut fields = Vec::with_capacity(definition.fields.len());
        let mut by_key = HashMap::new();
        for (key, registrations) in &definition.fields {
            let options =
                resolve_field_options(key, registrations, Some(&definition.key), remult)?;
            by_key.insert(key.clone(), fields.len());
            fields.push(Arc::new(FieldMetadata::from_options(options)?));
        }

        for field in &fields {
            if let Some(RelationKind::ToOneBy { field: holder }) =
                field.relation.as_ref().map(|r| &r.kind)
            {
                let holds_id = by_key
                    .get(holder)
                    .is_some_and(|&i| fields[i].is_column());
                if !holds_id {
                    return Err(ConfigurationError::Relation {
                        entity: definition.key.clone(),
                        field: field.key.clone(),
                        message: format!("\"{holder}\" is not a column of this entity"),
                    }
                    .into());
                }
            }
        }

        let id_keys = match &definition.options.id {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => {
                let fallback = if by_key.contains_key("id") {
                    Some("id".to_string())
                } else {
                    fields.iter().find(|f| f.is_column()).map(|f| f.key.clone())
                };
                fallback.into_iter().collect()
            }
        };
        let mut id_fields = Vec::with_capacity(id_keys.len());
        for key in &id_keys {
            match by_key.get(key).map(|&i| &fields[i]) {
                Some(field) if field.is_column() => id_fields.push(field.clone()),
                _ => {
                    return Err(ConfigurationError::UnknownIdField {
                        entity: definition.key.clone(),
                        field: key.clone(),
                    }
                    .into())
                }
            }
        }
        let id = match id_fields.len() {
            0 => return Err(ConfigurationError::NoFields(definition.key.clone()).into()),
            1 => IdMetadata::Single(id_fields.remove(0)),
            _ => IdMetadata::Compound(CompoundIdField { fields: id_fields }),
        };

        let options = definition.options.clone();
        tracing::debug!(entity = %definition.key, fields = fields.len(), "built entity metadata");
        Ok(Self {
            db_name: options
                .db_name
                .clone()
                .unwrap_or_else(|| definition.key.clone()),
            caption: options
                .caption
                .clone()
                .unwrap_or_else(|| make_title(&definition.key)),
            key: definition.key.clone(),
            id,
            options,
            fields,
            by_key,
        })
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[Arc<FieldMetadata>] {
        &self.fields
    }

    /// Persisted fields in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &Arc<FieldMetadata>> {
        self.fields.iter().filter(|f| f.is_column())
    }

    pub fn field(&self, key: &str) -> Option<&Arc<FieldMetadata>> {
        self.by_key.get(key).map(|&i| &self.fields[i])
    }

    pub(crate) fn require_field(&self, key: &str) -> Result<&Arc<FieldMetadata>> {
        self.field(key).ok_or_else(|| self.unknown_field(key))
    }

    fn unknown_field(&self, key: &str) -> RemultError {
        QueryError::UnknownField {
            entity: self.key.clone(),
            field: key.to_string(),
        }
        .into()
    }

    pub fn api_permissions(&self) -> ApiPermissions {
        let crud = self.options.allow_api_crud.unwrap_or(false);
        ApiPermissions {
            read: self.options.allow_api_read.unwrap_or(true),
            insert: self.options.allow_api_insert.unwrap_or(crud),
            update: self.options.allow_api_update.unwrap_or(crud),
            delete: self.options.allow_api_delete.unwrap_or(crud),
        }
    }

    /// Explicit default ordering, else ascending by id.
    pub fn default_order(&self) -> Vec<SortEntry> {
        match &self.options.default_order_by {
            Some(order) if !order.is_empty() => order.clone(),
            _ => self
                .id
                .fields()
                .iter()
                .map(|f| SortEntry::asc(f.key.clone()))
                .collect(),
        }
    }

    /// Id of a row given its in-memory values.
    pub fn get_id(&self, values: &Map<String, Value>) -> Value {
        self.id.get_id(values)
    }

    /// Db-level filter selecting the row with this id.
    pub fn id_db_filter(&self, id: &Value) -> Result<Value> {
        let filter = self.id.id_filter(id)?;
        self.translate_filter(&filter)
    }

    // ------------------------------------------------------------------------
    // Key-level → db-level translation
    // ------------------------------------------------------------------------

    /// Rewrite a filter expressed in field keys and in-memory values into db
    /// names and db values.
    pub fn translate_filter(&self, filter: &Value) -> Result<Value> {
        let obj = match filter {
            Value::Object(obj) => obj,
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(QueryError::MalformedFilter(format!(
                    "expected an object, received {other}"
                ))
                .into())
            }
        };
        let mut out = Map::new();
        for (key, condition) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let parts = sub_filters(condition)
                        .into_iter()
                        .map(|f| self.translate_filter(f))
                        .collect::<Result<Vec<_>>>()?;
                    out.insert(key.clone(), Value::Array(parts));
                }
                "$not" => {
                    out.insert(key.clone(), self.translate_filter(condition)?);
                }
                op if op.starts_with('$') => {
                    return Err(QueryError::UnknownOperator(op.to_string()).into())
                }
                field_key => {
                    let field = self
                        .field(field_key)
                        .filter(|f| f.is_column())
                        .ok_or_else(|| self.unknown_field(field_key))?;
                    out.insert(
                        field.db_name.clone(),
                        translate_condition(field, condition)?,
                    );
                }
            }
        }
        Ok(Value::Object(out))
    }

    pub fn translate_sort(&self, sort: &[SortEntry]) -> Result<Vec<SortEntry>> {
        sort.iter()
            .map(|entry| {
                let field = self
                    .field(&entry.field)
                    .filter(|f| f.is_column())
                    .ok_or_else(|| self.unknown_field(&entry.field))?;
                Ok(SortEntry {
                    field: field.db_name.clone(),
                    direction: entry.direction,
                })
            })
            .collect()
    }
}

fn translate_values(field: &FieldMetadata, values: &[Value]) -> Result<Value> {
    values
        .iter()
        .map(|v| field.to_db(v).map_err(RemultError::from))
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

fn translate_condition(field: &FieldMetadata, condition: &Value) -> Result<Value> {
    match condition {
        Value::Object(ops) if is_operator(condition) => {
            let mut out = Map::new();
            for (op, operand) in ops {
                let translated = match operand {
                    Value::Array(items)
                        if LIST_OPERATORS.contains(&op.as_str()) || op == "$ne" || op == "!=" =>
                    {
                        translate_values(field, items)?
                    }
                    _ if TEXT_OPERATORS.contains(&op.as_str()) || op == "$regex" => {
                        operand.clone()
                    }
                    _ => field.to_db(operand)?,
                };
                out.insert(op.clone(), translated);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Map::new();
            out.insert("$in".to_string(), translate_values(field, items)?);
            Ok(Value::Object(out))
        }
        direct => Ok(field.to_db(direct)?),
    }
}
