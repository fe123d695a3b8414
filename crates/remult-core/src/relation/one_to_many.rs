//! Helper for the rows on the "many" side of a relation.

use serde_json::{Map, Value};

use crate::{
    entity::EntityRow,
    error::Result,
    filter::and_filters,
    repository::{FindOptions, Repository},
};

/// Rows of `target` whose `field` holds `owner_id`.
#[derive(Debug, Clone)]
pub struct OneToMany {
    target: Repository,
    field: String,
    owner_id: Value,
    items: Option<Vec<EntityRow>>,
}

impl OneToMany {
    pub(crate) fn new(target: Repository, field: impl Into<String>, owner_id: Value) -> Self {
        Self {
            target,
            field: field.into(),
            owner_id,
            items: None,
        }
    }

    fn owner_filter(&self) -> Value {
        let mut filter = Map::new();
        filter.insert(self.field.clone(), self.owner_id.clone());
        Value::Object(filter)
    }

    /// Fetch the rows and keep them for [`OneToMany::lazy_items`].
    pub async fn load(&mut self) -> Result<&[EntityRow]> {
        let rows = self
            .target
            .find(FindOptions {
                filter: Some(self.owner_filter()),
                ..Default::default()
            })
            .await?;
        Ok(self.items.insert(rows).as_slice())
    }

    /// Rows from the last [`OneToMany::load`], if any.
    pub fn lazy_items(&self) -> Option<&[EntityRow]> {
        self.items.as_deref()
    }

    /// Query the related rows, narrowed by `options.filter`.
    pub async fn find(&self, options: FindOptions) -> Result<Vec<EntityRow>> {
        let filter = and_filters(Some(self.owner_filter()), options.filter);
        self.target
            .find(FindOptions { filter, ..options })
            .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.target.count(Some(&self.owner_filter())).await
    }

    /// A new unsaved row with the foreign key pre-set.
    pub fn create(&self, mut values: Map<String, Value>) -> Result<EntityRow> {
        values.insert(self.field.clone(), self.owner_id.clone());
        self.target.create(values)
    }

    /// Create and save a related row; the cached items are discarded.
    pub async fn insert(&mut self, values: Map<String, Value>) -> Result<EntityRow> {
        let mut row = self.create(values)?;
        self.target.save(&mut row).await?;
        self.items = None;
        Ok(row)
    }
}
