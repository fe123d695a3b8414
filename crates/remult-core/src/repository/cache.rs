//! Per-repository identity cache.
//!
//! Each id maps to a single-slot cell. The first reader of an id runs the
//! fetch; concurrent readers of the same id await that same fetch. A failed
//! fetch leaves the cell empty so the next reader retries.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::entity::EntityRow;

/// Resolution cell: `Some(row)` when found, `None` when confirmed missing.
pub(crate) type CacheCell = Arc<OnceCell<Option<EntityRow>>>;

#[derive(Default)]
pub(crate) struct IdentityCache {
    cells: Mutex<HashMap<String, CacheCell>>,
}

impl IdentityCache {
    /// Resolved entry, `None` when absent or still loading.
    pub fn peek(&self, key: &str) -> Option<Option<EntityRow>> {
        self.cells.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    /// The cell for `key`, created empty when absent.
    pub fn cell(&self, key: &str) -> CacheCell {
        self.cells
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Replace the entry with a resolved value.
    pub fn put(&self, key: String, row: Option<EntityRow>) {
        self.cells
            .lock()
            .insert(key, Arc::new(OnceCell::new_with(Some(row))));
    }

    pub fn remove(&self, key: &str) {
        self.cells.lock().remove(key);
    }

    pub fn clear(&self) {
        self.cells.lock().clear();
    }
}
