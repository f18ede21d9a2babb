// src/query.rs
//! Query filter matching.
//!
//! Implements the document-side subset of the MongoDB query language the
//! command handlers need: implicit equality, the comparison operators
//! ($eq/$ne/$gt/$gte/$lt/$lte), array membership ($in/$nin), element
//! operators ($exists/$size), $regex, and the logical combinators
//! ($and/$or/$nor/$not). Field paths may use dot notation.

use crate::error::{Result, ServerError};
use crate::value_utils::{compare_for_sort, compare_values, get_path, values_equal};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// Check whether a document matches a filter.
pub fn matches_filter(doc: &Value, filter: &Value) -> Result<bool> {
    let conditions = match filter {
        Value::Object(map) => map,
        Value::Null => return Ok(true),
        _ => {
            return Err(ServerError::Exception(format!(
                "query filter must be an object, got: {}",
                filter
            )))
        }
    };

    for (key, condition) in conditions {
        let matched = match key.as_str() {
            "$and" => logical_all(doc, condition, "$and")?,
            "$or" => logical_any(doc, condition)?,
            "$nor" => !logical_any(doc, condition)?,
            _ => matches_condition(get_path(doc, key), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_all(doc: &Value, condition: &Value, op: &str) -> Result<bool> {
    let clauses = condition
        .as_array()
        .ok_or_else(|| ServerError::Exception(format!("{} expects an array", op)))?;
    for clause in clauses {
        if !matches_filter(doc, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_any(doc: &Value, condition: &Value) -> Result<bool> {
    let clauses = condition
        .as_array()
        .ok_or_else(|| ServerError::Exception("$or/$nor expects an array".to_string()))?;
    for clause in clauses {
        if matches_filter(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Match a single value against its condition, which is either an
/// operator document or a plain value compared for equality. Also used
/// by `$pull` to test array elements.
pub(crate) fn matches_condition(doc_value: Option<&Value>, condition: &Value) -> Result<bool> {
    if let Value::Object(ops) = condition {
        let is_operator_doc = !ops.is_empty() && ops.keys().all(|k| k.starts_with('$'));
        if is_operator_doc {
            for (op, arg) in ops {
                if op == "$options" {
                    // consumed by $regex
                    continue;
                }
                if !matches_operator(doc_value, op, arg, ops.get("$options"))? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(matches_equality(doc_value, condition))
}

/// Implicit equality: direct match, or membership when the document value
/// is an array.
fn matches_equality(doc_value: Option<&Value>, expected: &Value) -> bool {
    match doc_value {
        None => expected.is_null(),
        Some(actual) => {
            if values_equal(actual, expected) {
                return true;
            }
            match actual {
                Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                _ => false,
            }
        }
    }
}

fn matches_operator(
    doc_value: Option<&Value>,
    op: &str,
    arg: &Value,
    regex_options: Option<&Value>,
) -> Result<bool> {
    match op {
        "$eq" => Ok(matches_equality(doc_value, arg)),
        "$ne" => Ok(!matches_equality(doc_value, arg)),
        "$gt" => Ok(compare_to(doc_value, arg) == Some(Ordering::Greater)),
        "$gte" => Ok(matches!(
            compare_to(doc_value, arg),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        "$lt" => Ok(compare_to(doc_value, arg) == Some(Ordering::Less)),
        "$lte" => Ok(matches!(
            compare_to(doc_value, arg),
            Some(Ordering::Less | Ordering::Equal)
        )),
        "$in" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| ServerError::Exception("$in expects an array".to_string()))?;
            Ok(candidates
                .iter()
                .any(|candidate| matches_equality(doc_value, candidate)))
        }
        "$nin" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| ServerError::Exception("$nin expects an array".to_string()))?;
            Ok(!candidates
                .iter()
                .any(|candidate| matches_equality(doc_value, candidate)))
        }
        "$exists" => {
            let wanted = crate::document::is_true(Some(arg));
            Ok(doc_value.is_some() == wanted)
        }
        "$size" => {
            let expected = arg
                .as_i64()
                .ok_or_else(|| ServerError::Exception("$size expects an integer".to_string()))?;
            Ok(match doc_value {
                Some(Value::Array(items)) => items.len() as i64 == expected,
                _ => false,
            })
        }
        "$not" => Ok(!matches_condition(doc_value, arg)?),
        "$regex" => matches_regex(doc_value, arg, regex_options),
        other => Err(ServerError::Exception(format!(
            "unsupported query operator: {}",
            other
        ))),
    }
}

fn compare_to(doc_value: Option<&Value>, arg: &Value) -> Option<Ordering> {
    doc_value.and_then(|v| compare_values(v, arg))
}

fn matches_regex(
    doc_value: Option<&Value>,
    pattern: &Value,
    options: Option<&Value>,
) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| ServerError::Exception("$regex expects a string".to_string()))?;
    let case_insensitive = options
        .and_then(|o| o.as_str())
        .map(|o| o.contains('i'))
        .unwrap_or(false);
    let source = if case_insensitive {
        format!("(?i){}", pattern)
    } else {
        pattern.to_string()
    };
    let regex = Regex::new(&source)
        .map_err(|e| ServerError::Exception(format!("invalid $regex: {}", e)))?;
    Ok(match doc_value {
        Some(Value::String(s)) => regex.is_match(s),
        _ => false,
    })
}

/// Sort documents in place by an order-by document of `field -> ±1`
/// pairs, applied in field order.
pub fn sort_documents(docs: &mut [Value], order_by: &Value) {
    let spec: Vec<(String, bool)> = match order_by.as_object() {
        Some(map) => map
            .iter()
            .map(|(field, dir)| (field.clone(), dir.as_f64().map(|d| d < 0.0).unwrap_or(false)))
            .collect(),
        None => return,
    };
    if spec.is_empty() {
        return;
    }

    docs.sort_by(|a, b| {
        for (field, descending) in &spec {
            let ordering = compare_for_sort(get_path(a, field), get_path(b, field));
            if ordering != Ordering::Equal {
                return if *descending { ordering.reverse() } else { ordering };
            }
        }
        Ordering::Equal
    });
}
