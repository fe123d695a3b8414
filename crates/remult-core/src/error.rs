use std::collections::BTreeMap;

use thiserror::Error;

// ---------------------------------------------------------------------------
// ConversionError
// ---------------------------------------------------------------------------

/// A value could not be converted between its in-memory, db or wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConversionError {
    pub message: String,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Invalid name \"{0}\": must match ^[a-zA-Z_][a-zA-Z0-9_]*$")]
    InvalidName(String),

    #[error("Field \"{field}\" has no target entity")]
    MissingTarget { field: String },

    #[error("Entity \"{0}\" declares no fields")]
    NoFields(String),

    #[error("Entity \"{entity}\" uses undeclared field \"{field}\" as its id")]
    UnknownIdField { entity: String, field: String },

    #[error("Relation \"{entity}.{field}\": {message}")]
    Relation {
        entity: String,
        field: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Aggregate validation failure for one save.
///
/// `field_errors` is keyed by field key. `message` describes the first failing
/// field (in declaration order) as `"{caption}: {message}"`, or carries an
/// entity-level message when no single field is to blame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub field_errors: BTreeMap<String, String>,
}

impl ValidationError {
    /// An entity-level failure not attributed to any field.
    pub fn entity(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_errors: BTreeMap::new(),
        }
    }

    /// A failure attributed to a single field.
    pub fn field(key: impl Into<String>, message: impl Into<String>) -> Self {
        let key = key.into();
        let message = message.into();
        let mut field_errors = BTreeMap::new();
        field_errors.insert(key.clone(), message.clone());
        Self {
            message: format!("{key}: {message}"),
            field_errors,
        }
    }

    pub fn field_error(&self, key: &str) -> Option<&str> {
        self.field_errors.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Duplicate id {id} in \"{entity}\"")]
    DuplicateId { entity: String, id: String },

    #[error("Row not found: {entity}/{id}")]
    RowNotFound { entity: String, id: String },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProviderError {
    pub fn backend(message: impl Into<String>) -> Self {
        ProviderError::Backend {
            message: message.into(),
            source: None,
        }
    }
}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("Unknown field \"{field}\" on entity \"{entity}\"")]
    UnknownField { entity: String, field: String },

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Malformed filter: {0}")]
    MalformedFilter(String),
}

// ---------------------------------------------------------------------------
// RemultError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RemultError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{entity} with id \"{id}\" not found")]
    NotFound { entity: String, id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RemultError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            RemultError::Validation(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RemultError::NotFound { .. }
                | RemultError::Provider(ProviderError::RowNotFound { .. })
        )
    }
}

/// Convenience alias; the default error type is `RemultError`.
pub type Result<T, E = RemultError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
