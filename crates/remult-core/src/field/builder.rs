//! Field declarations and the resolution of their partial options.
//!
//! A field key may be registered several times on one entity. Each
//! registration is an ordered list of contributions; contributions are applied
//! in order to an empty options object, and the resulting options of later
//! registrations are merged onto earlier ones. Defaults are filled once, after
//! all registrations have been merged.

use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::{
    context::Remult,
    converters::{
        format_date, AutoIncrementConverter, DateOnlyConverter, EnumConverter, IntegerConverter,
        JsonConverter, ObjectConverter, SharedConverter, ValueConverter,
    },
    error::{ConfigurationError, Result},
    validation::Validator,
};

use super::options::{FieldContribution, FieldOptions, FieldSavingEvent, ValueType};

// ============================================================================
// Names
// ============================================================================

fn name_regex() -> &'static regex::Regex {
    static NAME_REGEX: OnceLock<regex::Regex> = OnceLock::new();
    NAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("name regex is valid")
    })
}

/// Entity and field keys must be plain identifiers.
pub fn validate_name(name: &str) -> Result<()> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidName(name.to_string()).into())
    }
}

/// Derive a display caption from a key: `"createdAt"` → `"Created At"`.
pub fn make_title(name: &str) -> String {
    let mut spaced = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            spaced.push(' ');
        }
        spaced.push(c);
    }
    let mut chars = spaced.chars();
    let titled = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    titled.replacen("Email", "eMail", 1).replacen(" I D", " ID", 1)
}

// ============================================================================
// FieldDeclaration
// ============================================================================

/// One registration of a field: an ordered list of option contributions.
#[derive(Debug, Clone, Default)]
pub struct FieldDeclaration {
    contributions: Vec<FieldContribution>,
}

impl FieldDeclaration {
    /// A declaration with no declared type.
    pub fn new() -> Self {
        Self::default()
    }

    fn typed(value_type: ValueType) -> Self {
        Self::new().with(FieldOptions {
            value_type: Some(value_type),
            ..Default::default()
        })
    }

    fn converted(value_type: ValueType, converter: impl ValueConverter + 'static) -> Self {
        Self::new().with(FieldOptions {
            value_type: Some(value_type),
            value_converter: Some(Arc::new(converter)),
            ..Default::default()
        })
    }

    /// Append a shallow-merged options contribution.
    pub fn with(mut self, options: FieldOptions) -> Self {
        self.contributions.push(FieldContribution::Options(options));
        self
    }

    /// Append a mutating contribution.
    pub fn configure(
        mut self,
        configure: impl Fn(&mut FieldOptions, &Remult) + Send + Sync + 'static,
    ) -> Self {
        self.contributions
            .push(FieldContribution::Configure(Arc::new(configure)));
        self
    }

    pub fn caption(self, caption: impl Into<String>) -> Self {
        self.with(FieldOptions {
            caption: Some(caption.into()),
            ..Default::default()
        })
    }

    pub fn db_name(self, db_name: impl Into<String>) -> Self {
        self.with(FieldOptions {
            db_name: Some(db_name.into()),
            ..Default::default()
        })
    }

    pub fn required(self) -> Self {
        self.with(FieldOptions {
            required: Some(true),
            ..Default::default()
        })
    }

    pub fn allow_null(self, allow_null: bool) -> Self {
        self.with(FieldOptions {
            allow_null: Some(allow_null),
            ..Default::default()
        })
    }

    pub fn min_length(self, min: usize) -> Self {
        self.with(FieldOptions {
            min_length: Some(min),
            ..Default::default()
        })
    }

    pub fn max_length(self, max: usize) -> Self {
        self.with(FieldOptions {
            max_length: Some(max),
            ..Default::default()
        })
    }

    pub fn default_value(self, make: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.with(FieldOptions {
            default_value: Some(Arc::new(make)),
            ..Default::default()
        })
    }

    /// Append a validator to whatever validators have accumulated so far.
    pub fn validate(self, validator: Validator) -> Self {
        self.configure(move |options, _| {
            options
                .validate
                .get_or_insert_with(Vec::new)
                .push(validator.clone());
        })
    }

    /// Apply this registration's contributions, in order, to empty options.
    pub(crate) fn resolve(&self, remult: &Remult) -> FieldOptions {
        let mut options = FieldOptions::default();
        for contribution in &self.contributions {
            match contribution {
                FieldContribution::Options(partial) => options.merge(partial),
                FieldContribution::Configure(configure) => configure(&mut options, remult),
            }
        }
        options
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Merge every registration of `key` and fill the remaining defaults.
///
/// `declaring_entity` fills an unset `target`; when neither is available the
/// field is misconfigured.
pub fn resolve_field_options(
    key: &str,
    registrations: &[FieldDeclaration],
    declaring_entity: Option<&str>,
    remult: &Remult,
) -> Result<FieldOptions> {
    validate_name(key)?;

    let mut options = FieldOptions::default();
    for registration in registrations {
        options.merge(&registration.resolve(remult));
    }

    if options.value_type.is_none() {
        options.value_type = Some(ValueType::Json);
    }
    if options.key.is_none() {
        options.key = Some(key.to_string());
    }
    if options.db_name.is_none() {
        options.db_name = options.key.clone();
    }
    if options.caption.is_none() {
        options.caption = Some(make_title(key));
    }
    if options.target.is_none() {
        options.target = declaring_entity.map(str::to_string);
    }
    if options.target.is_none() {
        return Err(ConfigurationError::MissingTarget {
            field: key.to_string(),
        }
        .into());
    }
    Ok(options)
}

// ============================================================================
// Fields: built-in declarations
// ============================================================================

fn now_iso() -> Value {
    Value::String(format_date(&chrono::Utc::now()))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Generate a random UUID (v4).
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a collision-resistant, time-sortable id (lowercase ULID).
pub fn generate_cuid() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

fn not_updatable() -> FieldOptions {
    FieldOptions {
        allow_api_update: Some(false),
        ..Default::default()
    }
}

/// Catalogue of field declarations.
pub struct Fields;

impl Fields {
    pub fn string() -> FieldDeclaration {
        FieldDeclaration::typed(ValueType::String)
    }

    pub fn number() -> FieldDeclaration {
        FieldDeclaration::typed(ValueType::Number)
    }

    pub fn integer() -> FieldDeclaration {
        FieldDeclaration::converted(ValueType::Number, IntegerConverter)
    }

    /// Integer id assigned by the data provider; never written by the API.
    pub fn auto_increment() -> FieldDeclaration {
        FieldDeclaration::converted(ValueType::Number, AutoIncrementConverter).with(FieldOptions {
            allow_api_update: Some(false),
            db_read_only: Some(true),
            ..Default::default()
        })
    }

    pub fn boolean() -> FieldDeclaration {
        FieldDeclaration::typed(ValueType::Boolean)
    }

    pub fn date() -> FieldDeclaration {
        FieldDeclaration::typed(ValueType::Date)
    }

    pub fn date_only() -> FieldDeclaration {
        FieldDeclaration::converted(ValueType::Date, DateOnlyConverter)
    }

    /// Stamped with the current time when the row is first saved.
    pub fn created_at() -> FieldDeclaration {
        Self::date().with(not_updatable()).with(FieldOptions {
            saving: Some(Arc::new(|value: &mut Value, event: FieldSavingEvent| {
                if event.is_new {
                    *value = now_iso();
                }
            })),
            ..Default::default()
        })
    }

    /// Stamped with the current time on every save.
    pub fn updated_at() -> FieldDeclaration {
        Self::date().with(not_updatable()).with(FieldOptions {
            saving: Some(Arc::new(|value: &mut Value, _: FieldSavingEvent| {
                *value = now_iso();
            })),
            ..Default::default()
        })
    }

    pub fn uuid() -> FieldDeclaration {
        Self::generated(generate_uuid)
    }

    pub fn cuid() -> FieldDeclaration {
        Self::generated(generate_cuid)
    }

    fn generated(generate: fn() -> String) -> FieldDeclaration {
        Self::string().with(not_updatable()).with(FieldOptions {
            default_value: Some(Arc::new(move || Value::String(generate()))),
            saving: Some(Arc::new(move |value: &mut Value, _: FieldSavingEvent| {
                if is_empty(value) {
                    *value = Value::String(generate());
                }
            })),
            ..Default::default()
        })
    }

    /// Arbitrary JSON stored in a native json column.
    pub fn json() -> FieldDeclaration {
        FieldDeclaration::converted(ValueType::Json, JsonConverter)
    }

    /// Arbitrary JSON stored as serialized text.
    pub fn object() -> FieldDeclaration {
        FieldDeclaration::converted(ValueType::Json, ObjectConverter)
    }

    /// One of a fixed set of literal values.
    pub fn literal(values: Vec<Value>) -> FieldDeclaration {
        let value_type = if values.iter().all(Value::is_number) && !values.is_empty() {
            ValueType::Number
        } else {
            ValueType::String
        };
        FieldDeclaration::converted(value_type, EnumConverter::new(values))
    }

    /// A field with a caller-supplied converter.
    pub fn custom(value_type: ValueType, converter: SharedConverter) -> FieldDeclaration {
        FieldDeclaration::new().with(FieldOptions {
            value_type: Some(value_type),
            value_converter: Some(converter),
            ..Default::default()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
