//! Partial field options and the contributions that accumulate them.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    context::Remult, converters::SharedConverter, relation::RelationOptions,
    validation::Validator,
};

// ============================================================================
// ValueType
// ============================================================================

/// Declared in-memory type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Date,
    Json,
    /// Relation to another entity; the stored value is the related id.
    Entity,
}

// ============================================================================
// Hook Types
// ============================================================================

/// Produces the initial value of a field on a newly created row.
pub type DefaultValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Passed to field saving hooks.
#[derive(Debug, Clone, Copy)]
pub struct FieldSavingEvent {
    pub is_new: bool,
}

/// Runs just before a row is written; may rewrite the field's value.
pub type FieldSavingFn = Arc<dyn Fn(&mut Value, FieldSavingEvent) + Send + Sync>;

/// Mutating contribution, invoked with the accumulating options.
pub type ConfigureFn = Arc<dyn Fn(&mut FieldOptions, &Remult) + Send + Sync>;

// ============================================================================
// FieldOptions
// ============================================================================

/// Partial options for one field. Every member is optional so that several
/// contributions can be layered; unset members are filled with defaults when
/// the entity's metadata is built.
#[derive(Clone, Default)]
pub struct FieldOptions {
    pub key: Option<String>,
    pub db_name: Option<String>,
    pub caption: Option<String>,
    pub value_type: Option<ValueType>,
    pub value_converter: Option<SharedConverter>,
    pub allow_null: Option<bool>,
    /// Shorthand for a leading `Validators::required()`.
    pub required: Option<bool>,
    /// Shorthand for a leading `Validators::max_length(n)`.
    pub max_length: Option<usize>,
    /// Shorthand for a leading `Validators::min_length(n)`.
    pub min_length: Option<usize>,
    pub validate: Option<Vec<Validator>>,
    pub default_value: Option<DefaultValueFn>,
    pub saving: Option<FieldSavingFn>,
    pub allow_api_update: Option<bool>,
    pub include_in_api: Option<bool>,
    pub db_read_only: Option<bool>,
    /// Key of the declaring entity.
    pub target: Option<String>,
    pub relation: Option<RelationOptions>,
}

impl FieldOptions {
    /// Shallow merge: every member set on `other` replaces the one on `self`.
    pub fn merge(&mut self, other: &FieldOptions) {
        macro_rules! take {
            ($($name:ident),*) => {
                $(if other.$name.is_some() {
                    self.$name = other.$name.clone();
                })*
            };
        }
        take!(
            key,
            db_name,
            caption,
            value_type,
            value_converter,
            allow_null,
            required,
            max_length,
            min_length,
            validate,
            default_value,
            saving,
            allow_api_update,
            include_in_api,
            db_read_only,
            target,
            relation
        );
    }
}

impl std::fmt::Debug for FieldOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldOptions")
            .field("key", &self.key)
            .field("db_name", &self.db_name)
            .field("caption", &self.caption)
            .field("value_type", &self.value_type)
            .field("value_converter", &self.value_converter)
            .field("allow_null", &self.allow_null)
            .field("required", &self.required)
            .field("max_length", &self.max_length)
            .field("min_length", &self.min_length)
            .field("validate", &self.validate.as_ref().map(Vec::len))
            .field("default_value", &self.default_value.as_ref().map(|_| "<fn>"))
            .field("saving", &self.saving.as_ref().map(|_| "<fn>"))
            .field("allow_api_update", &self.allow_api_update)
            .field("include_in_api", &self.include_in_api)
            .field("db_read_only", &self.db_read_only)
            .field("target", &self.target)
            .field("relation", &self.relation)
            .finish()
    }
}

// ============================================================================
// Contributions
// ============================================================================

/// One partial contribution to a field's options.
#[derive(Clone)]
pub enum FieldContribution {
    /// Shallow-merged onto the accumulating options.
    Options(FieldOptions),
    /// Invoked with the accumulating options; may mutate them freely.
    Configure(ConfigureFn),
}

impl std::fmt::Debug for FieldContribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldContribution::Options(o) => f.debug_tuple("Options").field(o).finish(),
            FieldContribution::Configure(_) => f.write_str("Configure(<fn>)"),
        }
    }
}

impl From<FieldOptions> for FieldContribution {
    fn from(options: FieldOptions) -> Self {
        FieldContribution::Options(options)
    }
}
