// src/document.rs
// Response-document helpers shared by the command handlers

use crate::value_utils::get_path;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// The identifier field of user collections.
pub const ID_FIELD: &str = "_id";

/// Stamp a response document with `ok: 1`.
pub fn mark_okay(doc: &mut Value) {
    if let Value::Object(map) = doc {
        map.insert("ok".to_string(), json!(1));
    }
}

/// A fresh `{ok: 1}` response.
pub fn okay() -> Value {
    json!({"ok": 1})
}

/// Single-batch cursor response: `{cursor: {id: 0, ns, firstBatch}, ok: 1}`.
pub fn cursor_response(namespace: &str, first_batch: Vec<Value>) -> Value {
    json!({
        "cursor": {
            "id": 0,
            "ns": namespace,
            "firstBatch": first_batch,
        },
        "ok": 1,
    })
}

/// Generated identifier for documents inserted without one.
pub fn new_object_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

/// Truthiness of an optional parameter: absent and null are false,
/// booleans count as themselves, numbers count as non-zero.
pub fn is_true(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => false,
    }
}

/// Integer parameter with a default for absent fields.
pub fn get_i64(doc: &Value, field: &str, default: i64) -> i64 {
    match doc.get(field) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(default),
        _ => default,
    }
}

/// Serialized byte size of a document, used by stats accounting.
pub fn document_size(doc: &Value) -> usize {
    serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0)
}

/// Apply a find-style projection (`field -> 0/1`) to a document.
///
/// Inclusion mode keeps only the named fields plus `_id` (unless `_id`
/// is explicitly excluded); exclusion mode keeps everything else.
/// Dotted paths are supported on the inclusion side.
pub fn apply_projection(doc: &Value, projection: &Value) -> Value {
    let spec = match projection.as_object() {
        Some(spec) if !spec.is_empty() => spec,
        _ => return doc.clone(),
    };

    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return doc.clone(),
    };

    let has_inclusions = spec.iter().any(|(_, v)| is_true(Some(v)));
    let has_non_id_exclusions = spec
        .iter()
        .any(|(field, v)| !is_true(Some(v)) && field != ID_FIELD);
    let include_mode = has_inclusions && !has_non_id_exclusions;

    let mut result = Map::new();
    if include_mode {
        // _id rides along unless explicitly excluded
        if spec.get(ID_FIELD).map(|v| is_true(Some(v))).unwrap_or(true) {
            if let Some(id) = obj.get(ID_FIELD) {
                result.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (field, action) in spec {
            if is_true(Some(action)) {
                if let Some(value) = get_path(doc, field) {
                    result.insert(field.clone(), value.clone());
                }
            }
        }
    } else {
        for (key, value) in obj {
            if spec.get(key).map(|v| is_true(Some(v))).unwrap_or(true) {
                result.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_okay() {
        let mut doc = json!({"n": 1});
        mark_okay(&mut doc);
        assert_eq!(doc, json!({"n": 1, "ok": 1}));
    }

    #[test]
    fn test_cursor_response_shape() {
        let response = cursor_response("testdb.c", vec![json!({"_id": 1})]);
        assert_eq!(response["cursor"]["id"], json!(0));
        assert_eq!(response["cursor"]["ns"], json!("testdb.c"));
        assert_eq!(response["cursor"]["firstBatch"], json!([{"_id": 1}]));
        assert_eq!(response["ok"], json!(1));
    }

    #[test]
    fn test_is_true() {
        assert!(is_true(Some(&json!(true))));
        assert!(is_true(Some(&json!(1))));
        assert!(!is_true(Some(&json!(0))));
        assert!(!is_true(Some(&json!(false))));
        assert!(!is_true(Some(&Value::Null)));
        assert!(!is_true(None));
    }

    #[test]
    fn test_projection_include_mode() {
        let doc = json!({"_id": 1, "a": "x", "b": "y"});
        assert_eq!(
            apply_projection(&doc, &json!({"a": 1})),
            json!({"_id": 1, "a": "x"})
        );
        assert_eq!(
            apply_projection(&doc, &json!({"a": 1, "_id": 0})),
            json!({"a": "x"})
        );
    }

    #[test]
    fn test_projection_exclude_mode() {
        let doc = json!({"_id": 1, "a": "x", "b": "y"});
        assert_eq!(
            apply_projection(&doc, &json!({"b": 0})),
            json!({"_id": 1, "a": "x"})
        );
        assert_eq!(apply_projection(&doc, &json!({"_id": 0})), json!({"a": "x", "b": "y"}));
    }

    #[test]
    fn test_projection_nested_include() {
        let doc = json!({"_id": 1, "address": {"city": "NYC", "zip": "10001"}});
        assert_eq!(
            apply_projection(&doc, &json!({"address.city": 1})),
            json!({"_id": 1, "address.city": "NYC"})
        );
    }

    #[test]
    fn test_object_ids_are_unique() {
        assert_ne!(new_object_id(), new_object_id());
    }
}
