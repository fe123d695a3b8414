//! Field validators.
//!
//! A validator passes, fails with its message, or fails with a message it
//! computes. Value validators skip null values. `unique` and
//! `relation_exists` need the data provider and are evaluated by the engine.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::{converters::join_values, entity::EntityRow, field::FieldMetadata};

pub const DEFAULT_MESSAGE: &str = "Invalid value";

// ============================================================================
// Verdict / Event
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Fails with the validator's message.
    Invalid,
    /// Fails with this message.
    Message(String),
}

impl From<bool> for Verdict {
    fn from(valid: bool) -> Self {
        if valid {
            Verdict::Valid
        } else {
            Verdict::Invalid
        }
    }
}

/// What a validator sees of the field being saved.
pub struct ValidateFieldEvent<'a> {
    pub field: &'a FieldMetadata,
    pub value: &'a Value,
    /// Persisted value; `None` for new rows.
    pub original_value: Option<&'a Value>,
    pub is_new: bool,
    pub is_backend: bool,
    pub row: &'a EntityRow,
}

impl ValidateFieldEvent<'_> {
    pub fn value_changed(&self) -> bool {
        self.is_new || self.row.was_changed(&self.field.key)
    }
}

pub type ValueCheck = Arc<dyn Fn(&Value) -> Verdict + Send + Sync>;
pub type EventCheck = Arc<dyn Fn(&ValidateFieldEvent<'_>) -> Verdict + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Rule {
    /// Not null, not `""`, not `0`.
    Required,
    /// Backend only: no other row holds the same value.
    Unique,
    /// Backend only: a non-null relation id resolves to a row.
    RelationExists,
    Value(ValueCheck),
    Event(EventCheck),
}

// ============================================================================
// Validator
// ============================================================================

#[derive(Clone)]
pub struct Validator {
    pub(crate) rule: Rule,
    default_message: String,
    message: Option<String>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("message", &self.message())
            .finish()
    }
}

impl Validator {
    fn new(rule: Rule, default_message: impl Into<String>) -> Self {
        Self {
            rule,
            default_message: default_message.into(),
            message: None,
        }
    }

    /// A validator over the field's value; null values pass.
    pub fn value(
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            Rule::Value(Arc::new(move |v: &Value| Verdict::from(check(v)))),
            message,
        )
    }

    /// A validator with access to the whole save event.
    pub fn custom(check: impl Fn(&ValidateFieldEvent<'_>) -> Verdict + Send + Sync + 'static) -> Self {
        Self::new(Rule::Event(Arc::new(check)), DEFAULT_MESSAGE)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.default_message)
    }

    /// Evaluate rules that need no provider access. Returns `None` for rules
    /// the engine must evaluate itself.
    pub(crate) fn check_local(&self, event: &ValidateFieldEvent<'_>) -> Option<Verdict> {
        match &self.rule {
            Rule::Required => Some(Verdict::from(!is_blank(event.value))),
            Rule::Value(_) if event.value.is_null() => Some(Verdict::Valid),
            Rule::Value(check) => Some(check(event.value)),
            Rule::Event(check) => Some(check(event)),
            Rule::Unique | Rule::RelationExists => None,
        }
    }

    /// Failure message for a verdict, `None` when valid.
    pub(crate) fn failure(&self, verdict: Verdict) -> Option<String> {
        match verdict {
            Verdict::Valid => None,
            Verdict::Message(m) if !m.is_empty() => Some(m),
            Verdict::Message(_) | Verdict::Invalid => Some(self.message().to_string()),
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        other => other.to_string().chars().count(),
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"))
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s/?#]+[^\s]*$").expect("url regex is valid")
    })
}

// ============================================================================
// Validators: built-in catalogue
// ============================================================================

pub struct Validators;

impl Validators {
    pub fn required() -> Validator {
        Validator::new(Rule::Required, "Should not be empty")
    }

    /// Runs only in a backend context, and only when the value is new or changed.
    pub fn unique() -> Validator {
        Validator::new(Rule::Unique, "already exists")
    }

    pub fn regex(regex: Regex) -> Validator {
        Validator::value(
            move |v| v.as_str().is_some_and(|s| regex.is_match(s)),
            DEFAULT_MESSAGE,
        )
    }

    pub fn email() -> Validator {
        Validator::value(
            |v| v.as_str().is_some_and(|s| email_regex().is_match(s)),
            "Invalid Email",
        )
    }

    pub fn url() -> Validator {
        Validator::value(
            |v| v.as_str().is_some_and(|s| url_regex().is_match(s)),
            "Invalid Url",
        )
    }

    pub fn in_values(values: Vec<Value>) -> Validator {
        let message = format!("Value must be one of {}", join_values(&values));
        Validator::value(move |v| values.contains(v), message)
    }

    pub fn not_null() -> Validator {
        Validator::new(
            Rule::Event(Arc::new(|e: &ValidateFieldEvent<'_>| {
                Verdict::from(!e.value.is_null())
            })),
            "Should not be null",
        )
    }

    /// Runs only in a backend context; null ids pass.
    pub fn relation_exists() -> Validator {
        Validator::new(Rule::RelationExists, "Relation value does not exist")
    }

    pub fn max_length(max: usize) -> Validator {
        Validator::value(
            move |v| text_len(v) <= max,
            format!("Value must be at most {max} characters"),
        )
    }

    pub fn min_length(min: usize) -> Validator {
        Validator::value(
            move |v| text_len(v) >= min,
            format!("Value must be at least {min} characters"),
        )
    }
}
