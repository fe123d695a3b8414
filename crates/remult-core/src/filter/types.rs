//! Sort and paging types shared by repositories, providers and live queries.

use serde::{Deserialize, Serialize};

// ============================================================================
// Sort Types
// ============================================================================

/// Sort direction for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A sort specification for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortEntry {
    pub field: String,
    pub direction: SortDirection,
}

impl SortEntry {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

// ============================================================================
// Paging
// ============================================================================

/// Number of rows to skip for a 1-based `page` of `limit` rows.
pub fn page_offset(limit: Option<usize>, page: Option<usize>) -> Option<usize> {
    match (limit, page) {
        (Some(limit), Some(page)) if page > 1 => Some((page - 1).saturating_mul(limit)),
        _ => None,
    }
}
