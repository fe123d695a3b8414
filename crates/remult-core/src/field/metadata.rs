//! Resolved, immutable field descriptors and id metadata.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::{
    converters::{
        BooleanConverter, DateConverter, DefaultConverter, NumberConverter, SharedConverter,
        StringConverter,
    },
    error::{ConfigurationError, ConversionError, Result},
    relation::{RelationKind, RelationOptions},
    validation::{Validator, Validators},
};

use super::options::{DefaultValueFn, FieldOptions, FieldSavingFn, ValueType};

// ============================================================================
// FieldMetadata
// ============================================================================

pub struct FieldMetadata {
    pub key: String,
    pub db_name: String,
    pub caption: String,
    pub value_type: ValueType,
    pub converter: SharedConverter,
    pub allow_null: bool,
    pub db_read_only: bool,
    pub allow_api_update: bool,
    pub include_in_api: bool,
    pub validators: Vec<Validator>,
    pub default_value: Option<DefaultValueFn>,
    pub saving: Option<FieldSavingFn>,
    pub relation: Option<RelationOptions>,
    /// Key of the declaring entity.
    pub target: String,
}

impl std::fmt::Debug for FieldMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMetadata")
            .field("key", &self.key)
            .field("db_name", &self.db_name)
            .field("caption", &self.caption)
            .field("value_type", &self.value_type)
            .field("converter", &self.converter)
            .field("allow_null", &self.allow_null)
            .field("db_read_only", &self.db_read_only)
            .field("validators", &self.validators.len())
            .field("relation", &self.relation)
            .field("target", &self.target)
            .finish()
    }
}

fn default_converter(value_type: ValueType) -> SharedConverter {
    match value_type {
        ValueType::String => Arc::new(StringConverter),
        ValueType::Number => Arc::new(NumberConverter),
        ValueType::Boolean => Arc::new(BooleanConverter),
        ValueType::Date => Arc::new(DateConverter),
        ValueType::Json | ValueType::Entity => Arc::new(DefaultConverter),
    }
}

impl FieldMetadata {
    /// Freeze fully-resolved options (see `resolve_field_options`).
    pub fn from_options(options: FieldOptions) -> Result<Self> {
        let key = options.key.clone().unwrap_or_default();
        let target = options
            .target
            .clone()
            .ok_or_else(|| ConfigurationError::MissingTarget { field: key.clone() })?;
        let value_type = options.value_type.unwrap_or(ValueType::Json);

        let mut validators = Vec::new();
        if options.required == Some(true) {
            validators.push(Validators::required());
        }
        if let Some(min) = options.min_length {
            validators.push(Validators::min_length(min));
        }
        if let Some(max) = options.max_length {
            validators.push(Validators::max_length(max));
        }
        validators.extend(options.validate.clone().unwrap_or_default());

        Ok(Self {
            db_name: options.db_name.clone().unwrap_or_else(|| key.clone()),
            caption: options.caption.clone().unwrap_or_else(|| key.clone()),
            converter: options
                .value_converter
                .clone()
                .unwrap_or_else(|| default_converter(value_type)),
            allow_null: options.allow_null.unwrap_or(false),
            db_read_only: options.db_read_only.unwrap_or(false),
            allow_api_update: options.allow_api_update.unwrap_or(true),
            include_in_api: options.include_in_api.unwrap_or(true),
            validators,
            default_value: options.default_value.clone(),
            saving: options.saving.clone(),
            relation: options.relation.clone(),
            value_type,
            target,
            key,
        })
    }

    pub fn field_type_in_db(&self) -> Option<&str> {
        self.converter.field_type_in_db()
    }

    /// True when the field is persisted (relations resolved through another
    /// field or through the related entity are not).
    pub fn is_column(&self) -> bool {
        self.relation.as_ref().map_or(true, |r| r.kind.is_column())
    }

    /// True for persisted relation fields whose value is the related id.
    pub fn is_lookup(&self) -> bool {
        self.relation.as_ref().is_some_and(|r| r.kind.is_column())
    }

    /// True for relations that are only materialized by explicit loading.
    pub fn is_reference(&self) -> bool {
        self.relation
            .as_ref()
            .is_some_and(|r| !matches!(r.kind, RelationKind::Value))
    }

    pub fn initial_value(&self) -> Value {
        self.default_value
            .as_ref()
            .map_or(Value::Null, |make| make())
    }

    pub fn to_db(&self, value: &Value) -> std::result::Result<Value, ConversionError> {
        self.converter.to_db(value)
    }

    pub fn from_db(&self, value: &Value) -> std::result::Result<Value, ConversionError> {
        self.converter.from_db(value)
    }
}

// ============================================================================
// Ids
// ============================================================================

/// Several fields composed into one logical id, rendered as `"a,b"`.
#[derive(Debug, Clone)]
pub struct CompoundIdField {
    pub fields: Vec<Arc<FieldMetadata>>,
}

impl CompoundIdField {
    pub fn get_id(&self, values: &Map<String, Value>) -> Value {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| match values.get(&f.key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();
        Value::String(parts.join(","))
    }

    /// Split an id into its component values, keyed by field key.
    pub fn parse_id(&self, id: &Value) -> std::result::Result<Map<String, Value>, ConversionError> {
        if let Value::Object(obj) = id {
            return Ok(self
                .fields
                .iter()
                .map(|f| (f.key.clone(), obj.get(&f.key).cloned().unwrap_or(Value::Null)))
                .collect());
        }
        let text = id
            .as_str()
            .ok_or_else(|| ConversionError::new(format!("Invalid compound id: {id}")))?;
        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() != self.fields.len() {
            return Err(ConversionError::new(format!(
                "Compound id \"{text}\" must have {} parts",
                self.fields.len()
            )));
        }
        let mut values = Map::new();
        for (field, part) in self.fields.iter().zip(parts) {
            let value = field.converter.from_json(&Value::String(part.to_string()))?;
            values.insert(field.key.clone(), value);
        }
        Ok(values)
    }

    /// AND of equalities over the component fields.
    pub fn id_filter(&self, id: &Value) -> std::result::Result<Value, ConversionError> {
        let values = self.parse_id(id)?;
        let parts: Vec<Value> = values
            .into_iter()
            .map(|(k, v)| {
                let mut eq = Map::new();
                eq.insert(k, v);
                Value::Object(eq)
            })
            .collect();
        Ok(json!({ "$and": parts }))
    }
}

/// Id of an entity: one field, or several composed.
#[derive(Debug, Clone)]
pub enum IdMetadata {
    Single(Arc<FieldMetadata>),
    Compound(CompoundIdField),
}

impl IdMetadata {
    pub fn fields(&self) -> Vec<Arc<FieldMetadata>> {
        match self {
            IdMetadata::Single(f) => vec![f.clone()],
            IdMetadata::Compound(c) => c.fields.clone(),
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, IdMetadata::Compound(_))
    }

    pub fn is_id_field(&self, key: &str) -> bool {
        match self {
            IdMetadata::Single(f) => f.key == key,
            IdMetadata::Compound(c) => c.fields.iter().any(|f| f.key == key),
        }
    }

    pub fn get_id(&self, values: &Map<String, Value>) -> Value {
        match self {
            IdMetadata::Single(f) => values.get(&f.key).cloned().unwrap_or(Value::Null),
            IdMetadata::Compound(c) => c.get_id(values),
        }
    }

    /// Key-level filter selecting the row with this id.
    pub fn id_filter(&self, id: &Value) -> std::result::Result<Value, ConversionError> {
        match self {
            IdMetadata::Single(f) => {
                let mut eq = Map::new();
                eq.insert(f.key.clone(), f.converter.from_json(id)?);
                Ok(Value::Object(eq))
            }
            IdMetadata::Compound(c) => c.id_filter(id),
        }
    }

    /// Key-level filter selecting every row whose id is in `ids`.
    pub fn ids_filter(&self, ids: &[Value]) -> std::result::Result<Value, ConversionError> {
        match self {
            IdMetadata::Single(f) => {
                let values = ids
                    .iter()
                    .map(|id| f.converter.from_json(id))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let mut filter = Map::new();
                filter.insert(f.key.clone(), json!({ "$in": values }));
                Ok(Value::Object(filter))
            }
            IdMetadata::Compound(c) => {
                let parts = ids
                    .iter()
                    .map(|id| c.id_filter(id))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(json!({ "$or": parts }))
            }
        }
    }
}

/// Stable cache key for an id value.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
