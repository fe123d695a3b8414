//! Value converters: transforms between the in-memory value of a field and
//! its stored (db) and wire (json) forms.
//!
//! In-memory values are `serde_json::Value`s in a normalised shape (dates are
//! RFC 3339 UTC strings with millisecond precision, integers are whole
//! numbers). Null passes through every conversion unchanged.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use crate::error::ConversionError;

type ConvResult = std::result::Result<Value, ConversionError>;

// ============================================================================
// ValueConverter
// ============================================================================

/// Bidirectional transform for one field's values.
///
/// Every method has an identity default so converters only override the
/// directions they change.
pub trait ValueConverter: Send + Sync + std::fmt::Debug {
    fn to_db(&self, value: &Value) -> ConvResult {
        Ok(value.clone())
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        Ok(value.clone())
    }

    fn to_json(&self, value: &Value) -> ConvResult {
        Ok(value.clone())
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        Ok(value.clone())
    }

    /// Storage type hint for schema-aware providers (`"integer"`, `"json"`, ...).
    fn field_type_in_db(&self) -> Option<&str> {
        None
    }

    fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Identity / String
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct DefaultConverter;

impl ValueConverter for DefaultConverter {}

#[derive(Debug, Default, Clone)]
pub struct StringConverter;

impl StringConverter {
    fn coerce(value: &Value) -> ConvResult {
        match value {
            Value::Null | Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(ConversionError::new(format!(
                "Expected a string, received {}",
                type_name(other)
            ))),
        }
    }
}

impl ValueConverter for StringConverter {
    fn from_db(&self, value: &Value) -> ConvResult {
        Self::coerce(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        Self::coerce(value)
    }
}

// ============================================================================
// Number / Integer
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct NumberConverter;

fn parse_number(value: &Value) -> ConvResult {
    match value {
        Value::Null | Value::Number(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ConversionError::new(format!("\"{s}\" is not a number")))
        }
        other => Err(ConversionError::new(format!(
            "Expected a number, received {}",
            type_name(other)
        ))),
    }
}

impl ValueConverter for NumberConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        parse_number(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        parse_number(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        parse_number(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("number")
    }
}

/// Whole numbers. Fractions are truncated toward zero.
#[derive(Debug, Default, Clone)]
pub struct IntegerConverter;

fn parse_integer(value: &Value) -> ConvResult {
    match parse_number(value)? {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                return Ok(Value::Number(n));
            }
            let f = n.as_f64().unwrap_or(f64::NAN);
            if !f.is_finite() {
                return Err(ConversionError::new(format!("{n} is not a whole number")));
            }
            let whole = f.trunc();
            // i64::MAX as f64 rounds up to 2^63, which is itself out of range.
            if whole < i64::MIN as f64 || whole >= i64::MAX as f64 {
                return Err(ConversionError::new(format!(
                    "{n} is out of range for a whole number"
                )));
            }
            Ok(Value::from(whole as i64))
        }
        other => Ok(other),
    }
}

impl ValueConverter for IntegerConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("integer")
    }
}

/// Integer ids assigned by the data provider on insert.
#[derive(Debug, Default, Clone)]
pub struct AutoIncrementConverter;

impl ValueConverter for AutoIncrementConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        parse_integer(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("autoincrement")
    }
}

// ============================================================================
// Boolean
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct BooleanConverter;

fn parse_bool(value: &Value) -> ConvResult {
    match value {
        Value::Null | Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Ok(Value::Bool(false)),
            Some(f) if f == 1.0 => Ok(Value::Bool(true)),
            _ => Err(ConversionError::new(format!("{n} is not a boolean"))),
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(ConversionError::new(format!("\"{s}\" is not a boolean"))),
        },
        other => Err(ConversionError::new(format!(
            "Expected a boolean, received {}",
            type_name(other)
        ))),
    }
}

impl ValueConverter for BooleanConverter {
    fn from_db(&self, value: &Value) -> ConvResult {
        parse_bool(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        parse_bool(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("boolean")
    }
}

// ============================================================================
// Date / DateOnly
// ============================================================================

fn date_only_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date-only regex is valid"))
}

/// Parse any ISO 8601 timestamp (with or without offset), a bare date, or
/// epoch milliseconds.
pub fn parse_date(value: &Value) -> std::result::Result<DateTime<Utc>, ConversionError> {
    let invalid = || ConversionError::new(format!("Invalid date: {value}"));
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Ok(Utc.from_utc_datetime(&naive));
            }
            if date_only_regex().is_match(s) {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid())?;
                let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
                return Ok(Utc.from_utc_datetime(&midnight));
            }
            Err(invalid())
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Format a timestamp the way every date field stores it.
pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Default, Clone)]
pub struct DateConverter;

fn normalise_date(value: &Value) -> ConvResult {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if value.as_str().is_some_and(str::is_empty) {
        return Ok(Value::Null);
    }
    parse_date(value).map(|dt| Value::String(format_date(&dt)))
}

impl ValueConverter for DateConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        normalise_date(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        normalise_date(value)
    }

    fn to_json(&self, value: &Value) -> ConvResult {
        normalise_date(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        normalise_date(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("date")
    }
}

/// Calendar dates (`YYYY-MM-DD`); any time-of-day component is dropped.
#[derive(Debug, Default, Clone)]
pub struct DateOnlyConverter;

fn normalise_date_only(value: &Value) -> ConvResult {
    if value.is_null() || value.as_str().is_some_and(str::is_empty) {
        return Ok(Value::Null);
    }
    if let Some(s) = value.as_str() {
        if date_only_regex().is_match(s) {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| ConversionError::new(format!("Invalid date: {s}")))?;
            return Ok(value.clone());
        }
    }
    parse_date(value).map(|dt| Value::String(dt.format("%Y-%m-%d").to_string()))
}

impl ValueConverter for DateOnlyConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        normalise_date_only(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        normalise_date_only(value)
    }

    fn to_json(&self, value: &Value) -> ConvResult {
        normalise_date_only(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        normalise_date_only(value)
    }

    fn field_type_in_db(&self) -> Option<&str> {
        Some("date")
    }
}

// ============================================================================
// Json / Object
// ============================================================================

/// Arbitrary JSON stored natively by providers that support a json column.
#[derive(Debug, Default, Clone)]
pub struct JsonConverter;

impl ValueConverter for JsonConverter {
    fn field_type_in_db(&self) -> Option<&str> {
        Some("json")
    }
}

/// Arbitrary JSON stored as serialized text.
#[derive(Debug, Default, Clone)]
pub struct ObjectConverter;

impl ValueConverter for ObjectConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        if value.is_null() {
            return Ok(Value::Null);
        }
        serde_json::to_string(value)
            .map(Value::String)
            .map_err(|e| ConversionError::new(e.to_string()))
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        match value {
            Value::String(s) if s.is_empty() => Ok(Value::Null),
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ConversionError::new(e.to_string()))
            }
            other => Ok(other.clone()),
        }
    }
}

// ============================================================================
// Enum
// ============================================================================

/// Restricts values to a declared set (string or numeric literals).
#[derive(Debug, Clone)]
pub struct EnumConverter {
    values: Vec<Value>,
}

impl EnumConverter {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    fn check(&self, value: &Value) -> ConvResult {
        if value.is_null() || self.values.contains(value) {
            return Ok(value.clone());
        }
        Err(ConversionError::new(format!(
            "Value must be one of {}",
            join_values(&self.values)
        )))
    }
}

impl ValueConverter for EnumConverter {
    fn to_db(&self, value: &Value) -> ConvResult {
        self.check(value)
    }

    fn from_db(&self, value: &Value) -> ConvResult {
        self.check(value)
    }

    fn from_json(&self, value: &Value) -> ConvResult {
        self.check(value)
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Shared converter handle stored on field metadata.
pub type SharedConverter = Arc<dyn ValueConverter>;

// ============================================================================
// Tests
// ============================================================================
