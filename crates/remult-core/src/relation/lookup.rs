//! LookupColumn: the value of one id-holding relation on a row.
//!
//! State transitions:
//!
//! | set with                           | relation   | new state                   |
//! |------------------------------------|------------|-----------------------------|
//! | `Unset`                            | any        | `Empty`                     |
//! | `Null`, id is already the sentinel | reference  | `ExplicitNull(sentinel)`    |
//! | `Null`, otherwise                  | any        | `ExplicitNull(null)`        |
//! | `Id(v)`                            | any        | `IdOnly(v)`                 |
//! | `Row(r)`                           | value      | `IdOnly(r.id)` + cache fill |
//! | `Row(r)`                           | reference  | `Materialized(r)`           |
//!
//! The sentinel is `0` for numeric target ids and `""` otherwise, and only
//! applies when the relation disallows null.

use serde_json::Value;

use crate::{
    entity::EntityRow,
    error::{RemultError, Result},
    field::ValueType,
    filter::operators::deep_equals,
    repository::WeakRepository,
};

#[derive(Debug, Clone)]
pub enum LookupState {
    Empty,
    IdOnly(Value),
    Materialized { id: Value, item: Box<EntityRow> },
    /// Confirmed absent; holds the id written to the column.
    ExplicitNull(Value),
}

/// Input to [`LookupColumn::set`].
#[derive(Debug, Clone)]
pub enum RelationValue {
    Unset,
    Null,
    Id(Value),
    Row(EntityRow),
}

impl From<EntityRow> for RelationValue {
    fn from(row: EntityRow) -> Self {
        RelationValue::Row(row)
    }
}

impl From<Value> for RelationValue {
    fn from(value: Value) -> Self {
        if value.is_null() {
            RelationValue::Null
        } else {
            RelationValue::Id(value)
        }
    }
}

/// Result of a synchronous [`LookupColumn::get`].
#[derive(Debug, Clone)]
pub enum LookupItem {
    Ready(Option<EntityRow>),
    /// Not resolved yet; await [`LookupColumn::wait_load`].
    Pending,
}

impl LookupItem {
    pub fn ready(self) -> Option<Option<EntityRow>> {
        match self {
            LookupItem::Ready(item) => Some(item),
            LookupItem::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LookupItem::Pending)
    }
}

#[derive(Clone)]
pub struct LookupColumn {
    target: WeakRepository,
    id_type: ValueType,
    reference: bool,
    allow_null: bool,
    state: LookupState,
}

impl std::fmt::Debug for LookupColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupColumn")
            .field("target", &self.target.entity_key())
            .field("reference", &self.reference)
            .field("allow_null", &self.allow_null)
            .field("state", &self.state)
            .finish()
    }
}

impl LookupColumn {
    pub(crate) fn new(
        target: WeakRepository,
        id_type: ValueType,
        reference: bool,
        allow_null: bool,
    ) -> Self {
        Self {
            target,
            id_type,
            reference,
            allow_null,
            state: LookupState::Empty,
        }
    }

    pub fn state(&self) -> &LookupState {
        &self.state
    }

    pub fn is_reference(&self) -> bool {
        self.reference
    }

    /// The id written to the owning row's column.
    pub fn id(&self) -> Value {
        match &self.state {
            LookupState::Empty => Value::Null,
            LookupState::IdOnly(id) => id.clone(),
            LookupState::Materialized { id, .. } => id.clone(),
            LookupState::ExplicitNull(sentinel) => sentinel.clone(),
        }
    }

    fn empty_sentinel(&self) -> Value {
        match self.id_type {
            ValueType::Number => Value::from(0),
            _ => Value::String(String::new()),
        }
    }

    fn coerce_id(&self, id: Value) -> Value {
        match (&self.id_type, &id) {
            (ValueType::Number, Value::String(s)) => s
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| s.parse::<f64>().map(Value::from))
                .unwrap_or(id),
            _ => id,
        }
    }

    pub fn set(&mut self, value: RelationValue) {
        let value = match value {
            RelationValue::Id(id) if id.is_null() => RelationValue::Null,
            other => other,
        };
        self.state = match value {
            RelationValue::Unset => LookupState::Empty,
            RelationValue::Null
                if !self.allow_null
                    && self.reference
                    && deep_equals(&self.id(), &self.empty_sentinel()) =>
            {
                LookupState::ExplicitNull(self.empty_sentinel())
            }
            RelationValue::Null => LookupState::ExplicitNull(Value::Null),
            RelationValue::Id(id) => LookupState::IdOnly(self.coerce_id(id)),
            RelationValue::Row(row) if !self.reference => {
                let id = row.id();
                if let Some(target) = self.target.upgrade() {
                    target.add_to_cache(row);
                }
                LookupState::IdOnly(id)
            }
            RelationValue::Row(row) => LookupState::Materialized {
                id: row.id(),
                item: Box::new(row),
            },
        };
    }

    /// Adopt an id read back from storage. A stored empty sentinel reads as
    /// `ExplicitNull`; a stored null stays `Empty` unless nulls are allowed.
    pub(crate) fn restore(&mut self, id: Value) {
        let sentinel = self.empty_sentinel();
        self.state = if id.is_null() {
            if self.allow_null {
                LookupState::ExplicitNull(Value::Null)
            } else {
                LookupState::Empty
            }
        } else if !self.allow_null && deep_equals(&id, &sentinel) {
            LookupState::ExplicitNull(sentinel)
        } else {
            LookupState::IdOnly(self.coerce_id(id))
        };
    }

    /// Replace the id, discarding any materialized item.
    pub fn set_id(&mut self, id: Value) {
        self.set(RelationValue::from(id));
    }

    /// The materialized item, if any.
    pub fn item(&self) -> Option<&EntityRow> {
        match &self.state {
            LookupState::Materialized { item, .. } => Some(item),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self.get(), LookupItem::Pending)
    }

    /// Synchronous access.
    ///
    /// A value relation holding only an id consults the target's identity
    /// cache; on a miss a background load is started (when a Tokio runtime is
    /// available) and `Pending` is returned. Reference relations holding only
    /// an id stay `Pending` until explicitly loaded.
    pub fn get(&self) -> LookupItem {
        match &self.state {
            LookupState::Materialized { item, .. } => LookupItem::Ready(Some((**item).clone())),
            LookupState::Empty | LookupState::ExplicitNull(_) => LookupItem::Ready(None),
            LookupState::IdOnly(_) if self.reference => LookupItem::Pending,
            LookupState::IdOnly(id) => {
                let Some(target) = self.target.upgrade() else {
                    return LookupItem::Pending;
                };
                match target.cached(id) {
                    Some(found) => LookupItem::Ready(found),
                    None => {
                        if let Ok(handle) = tokio::runtime::Handle::try_current() {
                            let id = id.clone();
                            handle.spawn(async move {
                                if let Err(e) = target.load_cached(&id).await {
                                    tracing::warn!(
                                        entity = %target.metadata().key,
                                        id = %id,
                                        error = %e,
                                        "background relation load failed"
                                    );
                                }
                            });
                        }
                        LookupItem::Pending
                    }
                }
            }
        }
    }

    /// Resolve the related row, fetching it through the target's identity
    /// cache when needed. Reference relations become `Materialized`.
    pub async fn wait_load(&mut self) -> Result<Option<EntityRow>> {
        let id = match &self.state {
            LookupState::Materialized { item, .. } => return Ok(Some((**item).clone())),
            LookupState::Empty | LookupState::ExplicitNull(_) => return Ok(None),
            LookupState::IdOnly(id) => id.clone(),
        };
        let target = self.target.upgrade().ok_or_else(|| {
            RemultError::Internal(format!(
                "repository for \"{}\" was dropped",
                self.target.entity_key()
            ))
        })?;
        let found = target.load_cached(&id).await?;
        if self.reference {
            if let Some(row) = &found {
                self.state = LookupState::Materialized {
                    id,
                    item: Box::new(row.clone()),
                };
            }
        }
        Ok(found)
    }

    /// Wire form: `Some` only when the relation is materialized or
    /// confirmed absent.
    pub fn to_json(&self) -> Option<Value> {
        match &self.state {
            LookupState::Materialized { item, .. } => Some(Value::Object(item.to_value())),
            LookupState::ExplicitNull(_) => Some(Value::Null),
            LookupState::Empty | LookupState::IdOnly(_) => None,
        }
    }
}
