// src/update.rs
//! Update application: either a replacement document or a set of
//! update operators ($set, $unset, $inc, $mul, $min, $max, $push,
//! $pull, $addToSet) applied field by field.

use crate::document::ID_FIELD;
use crate::error::{Result, ServerError};
use crate::query;
use crate::value_utils::{compare_values, get_path, remove_path, set_path, values_equal};
use serde_json::Value;
use std::cmp::Ordering;

/// Apply an update to a document, returning the new document and whether
/// anything changed.
///
/// A document whose keys all start with `$` is treated as an operator
/// update; anything else replaces the document wholesale (the identifier
/// is preserved and must not change).
pub fn apply_update(doc: &Value, update: &Value) -> Result<(Value, bool)> {
    let ops = update
        .as_object()
        .ok_or_else(|| ServerError::Exception("update must be an object".to_string()))?;

    let is_operator_update = ops.keys().any(|k| k.starts_with('$'));
    if !is_operator_update {
        return apply_replacement(doc, update);
    }

    let mut result = doc.clone();
    let mut modified = false;
    for (op, fields) in ops {
        let fields = fields.as_object().ok_or_else(|| {
            ServerError::Exception(format!("modifier {} expects an object", op))
        })?;
        for (field, arg) in fields {
            if apply_operator(&mut result, op, field, arg)? {
                modified = true;
            }
        }
    }
    Ok((result, modified))
}

fn apply_replacement(doc: &Value, replacement: &Value) -> Result<(Value, bool)> {
    let old_id = doc.get(ID_FIELD).cloned();
    let new_id = replacement.get(ID_FIELD).cloned();
    if let (Some(old_id), Some(new_id)) = (&old_id, &new_id) {
        if !values_equal(old_id, new_id) {
            return Err(ServerError::Exception(
                "the _id field cannot be changed".to_string(),
            ));
        }
    }

    let mut result = replacement.clone();
    if let (Some(old_id), None) = (old_id, new_id) {
        if let Some(fields) = result.as_object() {
            // keep the identifier in front position
            let mut rebuilt = serde_json::Map::new();
            rebuilt.insert(ID_FIELD.to_string(), old_id);
            for (field, value) in fields {
                rebuilt.insert(field.clone(), value.clone());
            }
            result = Value::Object(rebuilt);
        }
    }
    let modified = &result != doc;
    Ok((result, modified))
}

fn apply_operator(doc: &mut Value, op: &str, field: &str, arg: &Value) -> Result<bool> {
    match op {
        "$set" => {
            let changed = get_path(doc, field) != Some(arg);
            if changed {
                set_path(doc, field, arg.clone());
            }
            Ok(changed)
        }
        "$unset" => Ok(remove_path(doc, field)),
        "$inc" => apply_arithmetic(doc, field, arg, "$inc"),
        "$mul" => apply_arithmetic(doc, field, arg, "$mul"),
        "$min" => {
            let keep_current = match get_path(doc, field) {
                Some(current) => compare_values(current, arg) != Some(Ordering::Greater),
                None => false,
            };
            if keep_current {
                Ok(false)
            } else {
                set_path(doc, field, arg.clone());
                Ok(true)
            }
        }
        "$max" => {
            let keep_current = match get_path(doc, field) {
                Some(current) => compare_values(current, arg) != Some(Ordering::Less),
                None => false,
            };
            if keep_current {
                Ok(false)
            } else {
                set_path(doc, field, arg.clone());
                Ok(true)
            }
        }
        "$push" => apply_push(doc, field, arg, false),
        "$addToSet" => apply_push(doc, field, arg, true),
        "$pull" => apply_pull(doc, field, arg),
        other => Err(ServerError::Exception(format!(
            "unknown modifier: {}",
            other
        ))),
    }
}

fn apply_arithmetic(doc: &mut Value, field: &str, arg: &Value, op: &str) -> Result<bool> {
    let operand = arg
        .as_f64()
        .ok_or_else(|| ServerError::Exception(format!("{} expects a numeric argument", op)))?;

    let current = match get_path(doc, field) {
        Some(value) => value
            .as_f64()
            .ok_or_else(|| {
                ServerError::Exception(format!("cannot apply {} to a non-numeric field", op))
            })?,
        // absent fields: $inc starts from 0, $mul yields 0
        None => 0.0,
    };

    let both_integral = get_path(doc, field)
        .map(|v| v.as_i64().is_some())
        .unwrap_or(true)
        && arg.as_i64().is_some();

    let result = if op == "$inc" { current + operand } else { current * operand };
    let new_value = if both_integral {
        Value::from(result as i64)
    } else {
        Value::from(result)
    };
    set_path(doc, field, new_value);
    Ok(true)
}

fn apply_push(doc: &mut Value, field: &str, arg: &Value, unique: bool) -> Result<bool> {
    // $each pushes multiple items, a plain value pushes itself
    let items: Vec<Value> = match arg {
        Value::Object(modifiers) if modifiers.contains_key("$each") => {
            match modifiers.get("$each") {
                Some(Value::Array(arr)) => arr.clone(),
                Some(other) => vec![other.clone()],
                None => vec![],
            }
        }
        other => vec![other.clone()],
    };

    let mut array = match get_path(doc, field) {
        Some(Value::Array(arr)) => arr.clone(),
        Some(_) => {
            return Err(ServerError::Exception(format!(
                "field '{}' is not an array",
                field
            )))
        }
        None => Vec::new(),
    };

    let mut modified = false;
    for item in items {
        if unique && array.iter().any(|existing| values_equal(existing, &item)) {
            continue;
        }
        array.push(item);
        modified = true;
    }
    if modified {
        set_path(doc, field, Value::Array(array));
    }
    Ok(modified)
}

fn apply_pull(doc: &mut Value, field: &str, condition: &Value) -> Result<bool> {
    let array = match get_path(doc, field) {
        Some(Value::Array(arr)) => arr.clone(),
        Some(_) => {
            return Err(ServerError::Exception(format!(
                "field '{}' is not an array",
                field
            )))
        }
        None => return Ok(false),
    };

    let mut kept = Vec::with_capacity(array.len());
    for item in array.iter() {
        if !pull_matches(item, condition)? {
            kept.push(item.clone());
        }
    }

    let modified = kept.len() != array.len();
    if modified {
        set_path(doc, field, Value::Array(kept));
    }
    Ok(modified)
}

// A $pull condition with operator keys is applied to every element,
// scalars included; a plain filter document matches object elements;
// anything else compares for equality.
fn pull_matches(item: &Value, condition: &Value) -> Result<bool> {
    let has_operators = condition
        .as_object()
        .map(|obj| obj.keys().any(|k| k.starts_with('$')))
        .unwrap_or(false);
    if has_operators {
        return query::matches_condition(Some(item), condition);
    }
    match condition {
        Value::Object(_) if item.is_object() => query::matches_filter(item, condition),
        _ => Ok(values_equal(item, condition)),
    }
}
