// src/value_utils.rs
//! Shared helpers for working with JSON values: dotted-path access,
//! path mutation and value comparison.

use serde_json::Value;
use std::cmp::Ordering;

/// Get a nested value with dot-notation support.
///
/// Supports simple fields (`"name"`), nested objects (`"address.city"`)
/// and array indexing (`"items.0.name"`).
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                if let Ok(index) = part.parse::<usize>() {
                    value = arr.get(index)?;
                } else {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Set a value along a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    set_at(doc, &parts, value);
}

fn set_at(current: &mut Value, parts: &[&str], value: Value) {
    if parts.is_empty() {
        return;
    }

    if parts.len() == 1 {
        match current {
            Value::Object(map) => {
                map.insert(parts[0].to_string(), value);
            }
            Value::Array(arr) => {
                if let Ok(index) = parts[0].parse::<usize>() {
                    if index < arr.len() {
                        arr[index] = value;
                    }
                }
            }
            _ => {
                let mut obj = serde_json::Map::new();
                obj.insert(parts[0].to_string(), value);
                *current = Value::Object(obj);
            }
        }
        return;
    }

    match current {
        Value::Object(map) => {
            let next = map
                .entry(parts[0].to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_at(next, &parts[1..], value);
        }
        Value::Array(arr) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                if index < arr.len() {
                    set_at(&mut arr[index], &parts[1..], value);
                }
            }
        }
        _ => {
            let mut obj = serde_json::Map::new();
            obj.insert(parts[0].to_string(), Value::Object(serde_json::Map::new()));
            *current = Value::Object(obj);
            set_at(current, parts, value);
        }
    }
}

/// Remove a value along a dotted path. Returns true if something was removed.
pub fn remove_path(doc: &mut Value, path: &str) -> bool {
    if !path.contains('.') {
        return match doc {
            Value::Object(map) => map.remove(path).is_some(),
            _ => false,
        };
    }

    let (head, rest) = path.split_once('.').unwrap();
    match doc {
        Value::Object(map) => match map.get_mut(head) {
            Some(inner) => remove_path(inner, rest),
            None => false,
        },
        _ => false,
    }
}

/// Compare two JSON values of compatible types.
///
/// Numbers compare through f64, strings lexicographically, booleans
/// false < true. Incompatible types yield `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            let f1 = n1.as_f64()?;
            let f2 = n2.as_f64()?;
            f1.partial_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        _ => None,
    }
}

/// Equality that treats 1 and 1.0 as the same value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

// Cross-type rank used for total ordering during sorts: missing and null
// sort first, then numbers, strings, objects, arrays, booleans.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total ordering over optional values, for sorting documents.
///
/// Missing fields sort before everything; values of different types sort
/// by type rank; incomparable same-type values compare equal so the sort
/// stays stable.
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Null), None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => {
            let rank = type_rank(x).cmp(&type_rank(y));
            if rank != Ordering::Equal {
                return rank;
            }
            compare_values(x, y).unwrap_or(Ordering::Equal)
        }
    }
}
