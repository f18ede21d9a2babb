// src/index.rs
// Unique indexes over ordered key tuples

use crate::error::{Result, ServerError};
use crate::value_utils::get_path;
use serde_json::Value;
use std::collections::BTreeSet;

/// One component of an index definition: a field path and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub field: String,
    pub ascending: bool,
}

impl IndexKey {
    pub fn new(field: impl Into<String>, ascending: bool) -> Self {
        IndexKey {
            field: field.into(),
            ascending,
        }
    }
}

/// Totally ordered key value. Numbers are normalized so that 1 and 1.0
/// produce the same key; arrays become compound values; objects key as
/// null (they are not sensibly indexable here).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    Compound(Vec<IndexValue>),
}

/// f64 wrapper with a total order (NaN sorts last).
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl From<&Value> for IndexValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexValue::Null,
            Value::Bool(b) => IndexValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
                        IndexValue::Int(f as i64)
                    } else {
                        IndexValue::Float(OrderedFloat(f))
                    }
                } else {
                    IndexValue::Null
                }
            }
            Value::String(s) => IndexValue::String(s.clone()),
            Value::Array(items) => {
                IndexValue::Compound(items.iter().map(IndexValue::from).collect())
            }
            Value::Object(_) => IndexValue::Null,
        }
    }
}

impl IndexValue {
    fn size_bytes(&self) -> usize {
        match self {
            IndexValue::Null => 1,
            IndexValue::Bool(_) => 1,
            IndexValue::Int(_) => 8,
            IndexValue::Float(_) => 8,
            IndexValue::String(s) => s.len(),
            IndexValue::Compound(items) => items.iter().map(IndexValue::size_bytes).sum(),
        }
    }
}

/// A unique index: a set of key tuples that rejects duplicates.
///
/// Index entries track key presence only; the owning collection stores
/// the documents themselves and keeps the entries in sync on every
/// insert, update and delete.
#[derive(Debug, Clone)]
pub struct UniqueIndex {
    name: String,
    keys: Vec<IndexKey>,
    entries: BTreeSet<Vec<IndexValue>>,
}

impl UniqueIndex {
    pub fn new(name: impl Into<String>, keys: Vec<IndexKey>) -> Self {
        UniqueIndex {
            name: name.into(),
            keys,
            entries: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[IndexKey] {
        &self.keys
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// The key tuple a document produces for this index. Missing fields
    /// key as null.
    pub fn key_of(&self, doc: &Value) -> Vec<IndexValue> {
        self.keys
            .iter()
            .map(|key| {
                get_path(doc, &key.field)
                    .map(IndexValue::from)
                    .unwrap_or(IndexValue::Null)
            })
            .collect()
    }

    fn duplicate_key_error(&self, namespace: &str) -> ServerError {
        ServerError::command_named(
            11000,
            "DuplicateKey",
            format!(
                "E11000 duplicate key error collection: {} index: {}",
                namespace, self.name
            ),
        )
    }

    /// Check whether a document could be added without violating
    /// uniqueness.
    pub fn check_add(&self, doc: &Value, namespace: &str) -> Result<()> {
        if self.entries.contains(&self.key_of(doc)) {
            return Err(self.duplicate_key_error(namespace));
        }
        Ok(())
    }

    /// Register a document's key. Fails on duplicates.
    pub fn add(&mut self, doc: &Value, namespace: &str) -> Result<()> {
        let key = self.key_of(doc);
        if !self.entries.insert(key) {
            return Err(self.duplicate_key_error(namespace));
        }
        Ok(())
    }

    /// Drop a document's key.
    pub fn remove(&mut self, doc: &Value) {
        let key = self.key_of(doc);
        self.entries.remove(&key);
    }

    /// Check whether replacing `old` with `new` keeps keys unique.
    pub fn check_replace(&self, old: &Value, new: &Value, namespace: &str) -> Result<()> {
        let old_key = self.key_of(old);
        let new_key = self.key_of(new);
        if old_key == new_key {
            return Ok(());
        }
        if self.entries.contains(&new_key) {
            return Err(self.duplicate_key_error(namespace));
        }
        Ok(())
    }

    /// Swap `old`'s key for `new`'s. Callers validate with
    /// `check_replace` first.
    pub fn replace(&mut self, old: &Value, new: &Value) {
        let old_key = self.key_of(old);
        let new_key = self.key_of(new);
        if old_key != new_key {
            self.entries.remove(&old_key);
            self.entries.insert(new_key);
        }
    }

    /// Rough byte-size of the index, for stats accounting.
    pub fn size_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|key| key.iter().map(IndexValue::size_bytes).sum::<usize>())
            .sum()
    }
}

/// Index factory: builds a unique index named after its key pattern
/// (`field_1`, `a_1_b_-1`, ...).
pub fn open_or_create_unique_index(collection_name: &str, keys: Vec<IndexKey>) -> UniqueIndex {
    let _ = collection_name; // the in-memory index has no per-collection storage to open
    let name = keys
        .iter()
        .map(|key| format!("{}_{}", key.field, if key.ascending { 1 } else { -1 }))
        .collect::<Vec<_>>()
        .join("_");
    UniqueIndex::new(name, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id_index() -> UniqueIndex {
        open_or_create_unique_index("c", vec![IndexKey::new("_id", true)])
    }

    #[test]
    fn test_factory_derives_name_from_keys() {
        assert_eq!(id_index().name(), "_id_1");
        let compound = open_or_create_unique_index(
            "c",
            vec![IndexKey::new("a", true), IndexKey::new("b", false)],
        );
        assert_eq!(compound.name(), "a_1_b_-1");
    }

    #[test]
    fn test_duplicate_detection() {
        let mut index = id_index();
        index.add(&json!({"_id": 1}), "db.c").unwrap();
        let err = index.add(&json!({"_id": 1}), "db.c").unwrap_err();
        assert_eq!(err.code(), Some(11000));
        index.add(&json!({"_id": 2}), "db.c").unwrap();
        assert_eq!(index.num_entries(), 2);
    }

    #[test]
    fn test_numeric_keys_normalize() {
        let mut index = id_index();
        index.add(&json!({"_id": 1}), "db.c").unwrap();
        assert!(index.check_add(&json!({"_id": 1.0}), "db.c").is_err());
    }

    #[test]
    fn test_missing_fields_key_as_null() {
        let mut index = open_or_create_unique_index("c", vec![IndexKey::new("a", true)]);
        index.add(&json!({"_id": 1}), "db.c").unwrap();
        assert!(index.add(&json!({"_id": 2}), "db.c").is_err());
    }

    #[test]
    fn test_replace() {
        let mut index = id_index();
        index.add(&json!({"_id": 1}), "db.c").unwrap();
        index.add(&json!({"_id": 2}), "db.c").unwrap();

        let old = json!({"_id": 1});
        let same_key = json!({"_id": 1, "a": "x"});
        index.check_replace(&old, &same_key, "db.c").unwrap();

        let collides = json!({"_id": 2, "a": "x"});
        assert!(index.check_replace(&old, &collides, "db.c").is_err());

        let moved = json!({"_id": 3});
        index.check_replace(&old, &moved, "db.c").unwrap();
        index.replace(&old, &moved);
        assert!(index.check_add(&json!({"_id": 1}), "db.c").is_ok());
        assert!(index.check_add(&json!({"_id": 3}), "db.c").is_err());
    }

    #[test]
    fn test_compound_key() {
        let mut index = open_or_create_unique_index(
            "c",
            vec![IndexKey::new("a", true), IndexKey::new("b", true)],
        );
        index.add(&json!({"a": 1, "b": 1}), "db.c").unwrap();
        index.add(&json!({"a": 1, "b": 2}), "db.c").unwrap();
        assert!(index.add(&json!({"a": 1, "b": 1}), "db.c").is_err());
    }
}
