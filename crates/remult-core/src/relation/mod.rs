//! Relation declarations between entities.
//!
//! - `Fields::entity(target)` stores the related id in its own column and
//!   resolves it eagerly through the target repository's identity cache.
//! - `Relations::to_one(target)` also stores the related id, but the related
//!   row is only materialized on explicit load (`include` or `load_relation`).
//! - `Relations::to_one_by(target, field)` reads the related id from another
//!   field of the owning row.
//! - `Relations::to_many(target, field)` selects target rows whose `field`
//!   holds the owning row's id.

pub mod lookup;
pub mod one_to_many;

use std::sync::Arc;

use crate::{
    entity::EntityDefinition,
    field::{FieldDeclaration, FieldOptions, Fields, ValueType},
};

pub use lookup::{LookupColumn, LookupItem, LookupState, RelationValue};
pub use one_to_many::OneToMany;

/// Lazily resolved target entity, so that entities can refer to each other.
pub type EntityRef = Arc<dyn Fn() -> Arc<EntityDefinition> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// Column holding the related id; resolved through the identity cache.
    Value,
    /// Column holding the related id; materialized on explicit load only.
    ToOne,
    /// The related id is held by `field` on the owning row.
    ToOneBy { field: String },
    /// Target rows whose `field` equals the owning row's id.
    ToMany { field: String },
}

impl RelationKind {
    pub fn is_column(&self) -> bool {
        matches!(self, RelationKind::Value | RelationKind::ToOne)
    }
}

#[derive(Clone)]
pub struct RelationOptions {
    pub target: EntityRef,
    pub kind: RelationKind,
    /// Skip eager resolution of `Value` relations during `find`.
    pub lazy: bool,
}

impl RelationOptions {
    pub fn target(&self) -> Arc<EntityDefinition> {
        (self.target)()
    }
}

impl std::fmt::Debug for RelationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationOptions")
            .field("target", &"<fn>")
            .field("kind", &self.kind)
            .field("lazy", &self.lazy)
            .finish()
    }
}

fn relation_declaration(target: EntityRef, kind: RelationKind) -> FieldDeclaration {
    FieldDeclaration::new().with(FieldOptions {
        value_type: Some(ValueType::Entity),
        relation: Some(RelationOptions {
            target,
            kind,
            lazy: false,
        }),
        ..Default::default()
    })
}

impl Fields {
    /// Value relation: the column holds the related id and the related row is
    /// resolved eagerly through the target's identity cache.
    pub fn entity(
        target: impl Fn() -> Arc<EntityDefinition> + Send + Sync + 'static,
    ) -> FieldDeclaration {
        relation_declaration(Arc::new(target), RelationKind::Value)
    }
}

/// Catalogue of reference relations.
pub struct Relations;

impl Relations {
    pub fn to_one(
        target: impl Fn() -> Arc<EntityDefinition> + Send + Sync + 'static,
    ) -> FieldDeclaration {
        relation_declaration(Arc::new(target), RelationKind::ToOne)
    }

    pub fn to_one_by(
        target: impl Fn() -> Arc<EntityDefinition> + Send + Sync + 'static,
        field: impl Into<String>,
    ) -> FieldDeclaration {
        relation_declaration(
            Arc::new(target),
            RelationKind::ToOneBy {
                field: field.into(),
            },
        )
    }

    pub fn to_many(
        target: impl Fn() -> Arc<EntityDefinition> + Send + Sync + 'static,
        field: impl Into<String>,
    ) -> FieldDeclaration {
        relation_declaration(
            Arc::new(target),
            RelationKind::ToMany {
                field: field.into(),
            },
        )
    }
}

impl FieldDeclaration {
    /// Skip eager resolution of this relation during `find`.
    pub fn lazy(self) -> Self {
        self.configure(|options, _| {
            if let Some(relation) = options.relation.as_mut() {
                relation.lazy = true;
            }
        })
    }
}
