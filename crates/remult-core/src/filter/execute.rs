//! In-memory query execution: scan-and-filter with sorting and paging.

use serde_json::Value;

use crate::error::Result;

use super::operators::{compare_values, filter_records, get_field_value};
use super::types::{SortDirection, SortEntry};

// ============================================================================
// Sorting
// ============================================================================

/// Sort records by multiple fields with cascading priority.
/// Returns a sorted copy; does not mutate the input.
pub fn sort_records(mut records: Vec<Value>, sort: &[SortEntry]) -> Vec<Value> {
    if sort.is_empty() {
        return records;
    }

    records.sort_by(|a, b| {
        for entry in sort {
            let va = get_field_value(a, &entry.field).unwrap_or(&Value::Null);
            let vb = get_field_value(b, &entry.field).unwrap_or(&Value::Null);
            let cmp = compare_values(va, vb);
            if cmp != std::cmp::Ordering::Equal {
                return if entry.direction == SortDirection::Desc {
                    cmp.reverse()
                } else {
                    cmp
                };
            }
        }
        std::cmp::Ordering::Equal
    });

    records
}

// ============================================================================
// Pagination
// ============================================================================

/// Apply offset then limit to a list of records.
pub fn paginate_records(
    records: Vec<Value>,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Vec<Value> {
    let start = offset.unwrap_or(0);
    let sliced = records.into_iter().skip(start);
    match limit {
        Some(n) => sliced.take(n).collect(),
        None => sliced.collect(),
    }
}

// ============================================================================
// Query Execution
// ============================================================================

/// Execute a filter/sort/page request against a list of records.
///
/// 1. Apply filter (if present).
/// 2. Sort.
/// 3. Paginate (offset then limit).
pub fn execute_query(
    records: Vec<Value>,
    filter: Option<&Value>,
    sort: &[SortEntry],
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<Vec<Value>> {
    let filtered = match filter {
        Some(filter) => filter_records(&records, filter)?,
        None => records,
    };
    let sorted = sort_records(filtered, sort);
    Ok(paginate_records(sorted, offset, limit))
}

/// Count records matching the filter.
pub fn count_matching(records: &[Value], filter: Option<&Value>) -> Result<usize> {
    match filter {
        Some(filter) => Ok(filter_records(records, filter)?.len()),
        None => Ok(records.len()),
    }
}

// ============================================================================
// Tests
// ============================================================================
