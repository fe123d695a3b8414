//! Entity declarations built with a fluent registration API.
//!
//! ```ignore
//! let tasks = entity("tasks")
//!     .field("id", Fields::auto_increment())
//!     .field("title", Fields::string().min_length(3))
//!     .field("completed", Fields::boolean())
//!     .build();
//! ```
//!
//! Declarations are frozen by `build()`; metadata is derived from them
//! lazily, once per `Remult` context.

use std::sync::Arc;

use crate::{
    error::{Result, ValidationError},
    field::FieldDeclaration,
    filter::SortEntry,
};

use super::row::EntityRow;

// ============================================================================
// Hook Types
// ============================================================================

/// Runs before a row is written. The flag is `true` for inserts.
pub type EntitySavingFn = Arc<dyn Fn(&mut EntityRow, bool) -> Result<()> + Send + Sync>;

/// Runs before a row is deleted; an error aborts the delete.
pub type EntityDeletingFn = Arc<dyn Fn(&EntityRow) -> Result<()> + Send + Sync>;

/// Cross-field validation; runs only after every field validator passed.
pub type EntityValidationFn =
    Arc<dyn Fn(&EntityRow) -> std::result::Result<(), ValidationError> + Send + Sync>;

// ============================================================================
// EntityOptions
// ============================================================================

#[derive(Clone, Default)]
pub struct EntityOptions {
    pub db_name: Option<String>,
    pub caption: Option<String>,
    /// Id field keys. Defaults to the field named `id`, else the first field.
    pub id: Option<Vec<String>>,
    pub allow_api_crud: Option<bool>,
    pub allow_api_read: Option<bool>,
    pub allow_api_insert: Option<bool>,
    pub allow_api_update: Option<bool>,
    pub allow_api_delete: Option<bool>,
    pub default_order_by: Option<Vec<SortEntry>>,
    pub saving: Option<EntitySavingFn>,
    pub deleting: Option<EntityDeletingFn>,
    pub validation: Option<EntityValidationFn>,
}

impl std::fmt::Debug for EntityOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityOptions")
            .field("db_name", &self.db_name)
            .field("caption", &self.caption)
            .field("id", &self.id)
            .field("allow_api_crud", &self.allow_api_crud)
            .field("allow_api_read", &self.allow_api_read)
            .field("allow_api_insert", &self.allow_api_insert)
            .field("allow_api_update", &self.allow_api_update)
            .field("allow_api_delete", &self.allow_api_delete)
            .field("default_order_by", &self.default_order_by)
            .field("saving", &self.saving.as_ref().map(|_| "<fn>"))
            .field("deleting", &self.deleting.as_ref().map(|_| "<fn>"))
            .field("validation", &self.validation.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

// ============================================================================
// EntityDefinition
// ============================================================================

/// A frozen entity declaration: key, options and the registrations of each
/// field in declaration order.
#[derive(Debug)]
pub struct EntityDefinition {
    pub(crate) key: String,
    pub(crate) options: EntityOptions,
    pub(crate) fields: Vec<(String, Vec<FieldDeclaration>)>,
}

impl EntityDefinition {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &EntityOptions {
        &self.options
    }

    /// Field keys in declaration order.
    pub fn field_keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }
}

/// Start declaring the entity stored under `key`.
pub fn entity(key: impl Into<String>) -> EntityBuilder {
    EntityBuilder {
        key: key.into(),
        options: EntityOptions::default(),
        fields: Vec::new(),
    }
}

pub struct EntityBuilder {
    key: String,
    options: EntityOptions,
    fields: Vec<(String, Vec<FieldDeclaration>)>,
}

impl EntityBuilder {
    pub fn options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a field. Registering the same key again adds another partial
    /// registration that is merged onto the earlier ones.
    pub fn field(mut self, key: impl Into<String>, declaration: FieldDeclaration) -> Self {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, registrations)) => registrations.push(declaration),
            None => self.fields.push((key, vec![declaration])),
        }
        self
    }

    pub fn db_name(mut self, db_name: impl Into<String>) -> Self {
        self.options.db_name = Some(db_name.into());
        self
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.options.caption = Some(caption.into());
        self
    }

    pub fn id<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.id = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn allow_api_crud(mut self, allow: bool) -> Self {
        self.options.allow_api_crud = Some(allow);
        self
    }

    pub fn default_order_by(mut self, order_by: Vec<SortEntry>) -> Self {
        self.options.default_order_by = Some(order_by);
        self
    }

    pub fn saving(
        mut self,
        hook: impl Fn(&mut EntityRow, bool) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.options.saving = Some(Arc::new(hook));
        self
    }

    pub fn deleting(mut self, hook: impl Fn(&EntityRow) -> Result<()> + Send + Sync + 'static) -> Self {
        self.options.deleting = Some(Arc::new(hook));
        self
    }

    pub fn validation(
        mut self,
        hook: impl Fn(&EntityRow) -> std::result::Result<(), ValidationError> + Send + Sync + 'static,
    ) -> Self {
        self.options.validation = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Arc<EntityDefinition> {
        Arc::new(EntityDefinition {
            key: self.key,
            options: self.options,
            fields: self.fields,
        })
    }
}
