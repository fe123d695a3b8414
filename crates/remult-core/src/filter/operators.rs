//! Filter operator evaluation.
//!
//! Filters are JSON objects keyed by field: a direct value means equality, an
//! array means `$in`, and an object whose keys all start with `$` is an
//! operator object. `$and`, `$or` and `$not` combine sub-filters.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{QueryError, RemultError, Result};

// ============================================================================
// Value Comparison
// ============================================================================

/// Compare two JSON values for ordering.
///
/// - Both Null → Equal
/// - a is Null → Greater (nulls sort to end)
/// - b is Null → Less
/// - Both numbers → f64 comparison (NaN treated as Equal)
/// - Both strings → lexicographic (codepoint order)
/// - Both booleans → false < true
/// - Cross-type → type rank: number(0), string(1), bool(2), other(3)
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(f64::NAN);
            let fb = nb.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

// ============================================================================
// Equality
// ============================================================================

/// Deep equality where numbers compare by value (`1 == 1.0`).
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => match (na.as_f64(), nb.as_f64()) {
            (Some(fa), Some(fb)) => fa == fb,
            _ => na == nb,
        },
        (Value::Array(xa), Value::Array(xb)) => {
            xa.len() == xb.len() && xa.iter().zip(xb).all(|(x, y)| deep_equals(x, y))
        }
        (Value::Object(oa), Value::Object(ob)) => {
            oa.len() == ob.len()
                && oa
                    .iter()
                    .all(|(k, v)| ob.get(k).is_some_and(|w| deep_equals(v, w)))
        }
        _ => a == b,
    }
}

// ============================================================================
// Operator Detection
// ============================================================================

/// Returns true if `value` is a non-empty object where ALL keys are operators.
pub fn is_operator(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => obj.keys().all(|k| k.starts_with('$') || k == "!="),
        _ => false,
    }
}

/// Operators whose operand is a list of values.
pub const LIST_OPERATORS: &[&str] = &["$in", "$nin"];

/// Operators whose operand is a substring and is never converted.
pub const TEXT_OPERATORS: &[&str] = &["$contains", "$notContains", "$startsWith", "$endsWith"];

// ============================================================================
// Field Path Resolution
// ============================================================================

/// Get a nested value from a record using a dot-separated path.
/// Returns `None` if any path segment is missing or the parent is not an object.
pub fn get_field_value<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// ============================================================================
// Operator Evaluation
// ============================================================================

fn ordered(value: &Value, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if value.is_null() || operand.is_null() {
        return false;
    }
    accept(compare_values(value, operand))
}

fn text_operands<'a>(value: &'a Value, operand: &'a Value) -> Option<(String, String)> {
    Some((value.as_str()?.to_lowercase(), operand.as_str()?.to_lowercase()))
}

/// Evaluate a single operator against a field value.
fn evaluate_operator(value: &Value, op: &str, operand: &Value) -> Result<bool> {
    match op {
        "$eq" => Ok(deep_equals(value, operand)),

        "$ne" | "!=" => {
            if let Some(items) = operand.as_array() {
                return Ok(!items.iter().any(|item| deep_equals(value, item)));
            }
            Ok(!deep_equals(value, operand))
        }

        "$gt" => Ok(ordered(value, operand, |o| o == Ordering::Greater)),
        "$gte" => Ok(ordered(value, operand, |o| o != Ordering::Less)),
        "$lt" => Ok(ordered(value, operand, |o| o == Ordering::Less)),
        "$lte" => Ok(ordered(value, operand, |o| o != Ordering::Greater)),

        "$in" => {
            let items = match operand.as_array() {
                Some(a) => a,
                None => return Ok(deep_equals(value, operand)),
            };
            Ok(items.iter().any(|item| deep_equals(value, item)))
        }

        "$nin" => {
            let items = match operand.as_array() {
                Some(a) => a,
                None => return Ok(!deep_equals(value, operand)),
            };
            Ok(!items.iter().any(|item| deep_equals(value, item)))
        }

        // Case-insensitive substring match on strings; element match on arrays.
        "$contains" => {
            if let Some(arr) = value.as_array() {
                return Ok(arr.iter().any(|item| deep_equals(item, operand)));
            }
            Ok(text_operands(value, operand).is_some_and(|(v, o)| v.contains(&o)))
        }

        "$notContains" => {
            if let Some(arr) = value.as_array() {
                return Ok(!arr.iter().any(|item| deep_equals(item, operand)));
            }
            Ok(!text_operands(value, operand).is_some_and(|(v, o)| v.contains(&o)))
        }

        "$startsWith" => Ok(text_operands(value, operand).is_some_and(|(v, o)| v.starts_with(&o))),

        "$endsWith" => Ok(text_operands(value, operand).is_some_and(|(v, o)| v.ends_with(&o))),

        "$regex" => {
            let Some(text) = value.as_str() else {
                return Ok(false);
            };
            let pattern = match operand.as_str() {
                Some(p) => p,
                None => return Ok(false),
            };
            let re = regex::Regex::new(pattern)
                .map_err(|e| RemultError::Query(QueryError::InvalidRegex(e.to_string())))?;
            Ok(re.is_match(text))
        }

        other => Err(RemultError::Query(QueryError::UnknownOperator(
            other.to_string(),
        ))),
    }
}

/// Evaluate an operator object `{ $op: operand, ... }` against a value.
fn evaluate_operators(value: &Value, ops: &Map<String, Value>) -> Result<bool> {
    for (op, operand) in ops {
        if !evaluate_operator(value, op, operand)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Filter Evaluation
// ============================================================================

/// Evaluate a field condition against a value.
fn evaluate_field_filter(value: &Value, filter: &Value) -> Result<bool> {
    match filter {
        Value::Object(ops) if is_operator(filter) => evaluate_operators(value, ops),
        Value::Array(_) => evaluate_operator(value, "$in", filter),
        direct => Ok(deep_equals(value, direct)),
    }
}

/// Evaluate a filter against a record.
///
/// Logical operators (`$and`, `$or`, `$not`) are evaluated first; then field
/// conditions are evaluated (implicit AND). A missing field reads as null.
pub fn matches_filter(record: &Value, filter: &Value) -> Result<bool> {
    let filter_obj = match filter {
        Value::Object(o) => o,
        Value::Null => return Ok(true),
        other => {
            return Err(RemultError::Query(QueryError::MalformedFilter(format!(
                "expected an object, received {other}"
            ))))
        }
    };

    if let Some(and_val) = filter_obj.get("$and") {
        for sub in sub_filters(and_val) {
            if !matches_filter(record, sub)? {
                return Ok(false);
            }
        }
    }

    if let Some(or_val) = filter_obj.get("$or") {
        let mut any_match = false;
        for sub in sub_filters(or_val) {
            if matches_filter(record, sub)? {
                any_match = true;
                break;
            }
        }
        if !any_match {
            return Ok(false);
        }
    }

    if let Some(not_val) = filter_obj.get("$not") {
        if matches_filter(record, not_val)? {
            return Ok(false);
        }
    }

    for (key, field_filter) in filter_obj {
        if key.starts_with('$') {
            continue;
        }
        let value = get_field_value(record, key).unwrap_or(&Value::Null);
        if !evaluate_field_filter(value, field_filter)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// `$and`/`$or` accept either an array of filters or a single filter.
pub(crate) fn sub_filters(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => vec![],
        single => vec![single],
    }
}

/// Filter a slice of records, returning those that match the filter (cloned).
pub fn filter_records(records: &[Value], filter: &Value) -> Result<Vec<Value>> {
    let mut result = Vec::new();
    for record in records {
        if matches_filter(record, filter)? {
            result.push(record.clone());
        }
    }
    Ok(result)
}

/// Combine two optional filters with `$and`.
pub fn and_filters(a: Option<Value>, b: Option<Value>) -> Option<Value> {
    match (a, b) {
        (None, None) => None,
        (Some(f), None) | (None, Some(f)) => Some(f),
        (Some(a), Some(b)) => Some(serde_json::json!({ "$and": [a, b] })),
    }
}

// ============================================================================
// Tests
// ============================================================================
