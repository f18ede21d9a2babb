// src/collection.rs
// In-memory collection: document store, identifier uniqueness,
// registered unique indexes, query/update/delete execution

use crate::document::{apply_projection, document_size, is_true, new_object_id, ID_FIELD};
use crate::error::{Result, ServerError};
use crate::query::{matches_filter, sort_documents};
use crate::update::apply_update;
use crate::value_utils::{compare_for_sort, get_path, values_equal};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

/// A named container of documents with an identifier-field uniqueness
/// rule and any number of registered unique indexes.
///
/// All state lives behind one `RwLock`; operations take `&self` and are
/// safe to call from concurrent command workers.
#[derive(Debug)]
pub struct Collection {
    state: RwLock<State>,
}

#[derive(Debug)]
struct State {
    database_name: String,
    name: String,
    id_field: Option<String>,
    documents: Vec<Value>,
    indexes: Vec<crate::index::UniqueIndex>,
}

impl State {
    fn full_name(&self) -> String {
        format!("{}.{}", self.database_name, self.name)
    }

    fn find_positions(&self, selector: &Value) -> Result<Vec<usize>> {
        let mut positions = Vec::new();
        for (pos, doc) in self.documents.iter().enumerate() {
            if matches_filter(doc, selector)? {
                positions.push(pos);
            }
        }
        Ok(positions)
    }

    /// Insert a single document, enforcing identifier and index
    /// uniqueness. Generates an `_id` when the identifier field is
    /// `_id` and the document has none.
    fn insert_one(&mut self, doc: &Value) -> Result<()> {
        let mut doc = match doc {
            Value::Object(_) => doc.clone(),
            _ => {
                return Err(ServerError::Exception(
                    "document must be an object".to_string(),
                ))
            }
        };

        if let Some(id_field) = self.id_field.clone() {
            if doc.get(&id_field).is_none() && id_field == ID_FIELD {
                // generated ids go in front, the way clients expect
                let mut with_id = Map::new();
                with_id.insert(ID_FIELD.to_string(), new_object_id());
                for (k, v) in doc.as_object().unwrap() {
                    with_id.insert(k.clone(), v.clone());
                }
                doc = Value::Object(with_id);
            }
            if let Some(id) = doc.get(&id_field) {
                let duplicate = self
                    .documents
                    .iter()
                    .any(|existing| match existing.get(&id_field) {
                        Some(existing_id) => values_equal(existing_id, id),
                        None => false,
                    });
                if duplicate {
                    return Err(ServerError::command_named(
                        11000,
                        "DuplicateKey",
                        format!(
                            "E11000 duplicate key error collection: {} index: {}_",
                            self.full_name(),
                            id_field
                        ),
                    ));
                }
            }
        }

        let namespace = self.full_name();
        for index in &self.indexes {
            index.check_add(&doc, &namespace)?;
        }
        for index in &mut self.indexes {
            index.add(&doc, &namespace)?;
        }
        self.documents.push(doc);
        Ok(())
    }

    /// Replace the document at `pos`, keeping all indexes consistent.
    fn replace_at(&mut self, pos: usize, new_doc: Value) -> Result<()> {
        let old_doc = self.documents[pos].clone();
        let namespace = self.full_name();
        for index in &self.indexes {
            index.check_replace(&old_doc, &new_doc, &namespace)?;
        }
        for index in &mut self.indexes {
            index.replace(&old_doc, &new_doc);
        }
        self.documents[pos] = new_doc;
        Ok(())
    }

    fn remove_at(&mut self, pos: usize) -> Value {
        let doc = self.documents.remove(pos);
        for index in &mut self.indexes {
            index.remove(&doc);
        }
        doc
    }

    /// Build the document an upsert inserts: the selector's plain
    /// equality fields with the update applied on top.
    fn upsert_one(&mut self, selector: &Value, update: &Value) -> Result<Value> {
        let mut base = Map::new();
        if let Some(conditions) = selector.as_object() {
            for (field, condition) in conditions {
                if field.starts_with('$') {
                    continue;
                }
                let is_operator_condition = condition
                    .as_object()
                    .map(|obj| obj.keys().any(|k| k.starts_with('$')))
                    .unwrap_or(false);
                if !is_operator_condition {
                    base.insert(field.clone(), condition.clone());
                }
            }
        }

        let (mut doc, _) = apply_update(&Value::Object(base), update)?;
        if self.id_field.as_deref() == Some(ID_FIELD) && doc.get(ID_FIELD).is_none() {
            if let Value::Object(map) = &mut doc {
                map.insert(ID_FIELD.to_string(), new_object_id());
            }
        }
        self.insert_one(&doc)?;
        Ok(doc)
    }
}

impl Collection {
    pub fn new(database_name: &str, name: &str, id_field: Option<&str>) -> Self {
        Collection {
            state: RwLock::new(State {
                database_name: database_name.to_string(),
                name: name.to_string(),
                id_field: id_field.map(|f| f.to_string()),
                documents: Vec::new(),
                indexes: Vec::new(),
            }),
        }
    }

    pub fn collection_name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Dotted `db.collection` namespace.
    pub fn full_name(&self) -> String {
        self.state.read().full_name()
    }

    pub fn num_indexes(&self) -> usize {
        self.state.read().indexes.len()
    }

    pub fn count(&self) -> usize {
        self.state.read().documents.len()
    }

    /// Count with an optional filter, skip, and limit (zero or negative
    /// limit means unbounded).
    pub fn count_query(&self, query: &Value, skip: i64, limit: i64) -> Result<usize> {
        let state = self.state.read();
        let mut n = 0usize;
        for doc in &state.documents {
            if matches_filter(doc, query)? {
                n += 1;
            }
        }
        drop(state);

        if skip > 0 {
            n = n.saturating_sub(skip as usize);
        }
        if limit > 0 {
            n = n.min(limit as usize);
        }
        Ok(n)
    }

    /// Insert a batch one document at a time; returns the number
    /// inserted. A failure mid-batch leaves earlier documents in place.
    pub fn insert_documents(&self, docs: &[Value]) -> Result<usize> {
        let mut state = self.state.write();
        let mut n = 0;
        for doc in docs {
            state.insert_one(doc)?;
            n += 1;
        }
        Ok(n)
    }

    /// Update matching documents. Returns
    /// `{n, nModified}` plus `upserted: id` when an upsert inserted.
    pub fn update_documents(
        &self,
        selector: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Value> {
        let mut state = self.state.write();
        let mut positions = state.find_positions(selector)?;

        if positions.is_empty() && upsert {
            let doc = state.upsert_one(selector, update)?;
            let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
            return Ok(json!({"n": 1, "nModified": 0, "upserted": id}));
        }

        if !multi {
            positions.truncate(1);
        }

        let n = positions.len();
        let mut n_modified = 0i64;
        for pos in positions {
            let old_doc = state.documents[pos].clone();
            let (new_doc, modified) = apply_update(&old_doc, update)?;
            if !modified {
                continue;
            }
            match (old_doc.get(ID_FIELD), new_doc.get(ID_FIELD)) {
                (Some(old_id), Some(new_id)) if !values_equal(old_id, new_id) => {
                    return Err(ServerError::Exception(
                        "the _id field cannot be changed".to_string(),
                    ));
                }
                _ => {}
            }
            state.replace_at(pos, new_doc)?;
            n_modified += 1;
        }

        Ok(json!({"n": n as i64, "nModified": n_modified}))
    }

    /// Delete matching documents; a positive limit caps the count, zero
    /// or negative removes every match. Returns the number removed.
    pub fn delete_documents(&self, selector: &Value, limit: i64) -> Result<usize> {
        let mut state = self.state.write();
        let mut positions = state.find_positions(selector)?;
        if limit > 0 {
            positions.truncate(limit as usize);
        }
        // back to front so earlier positions stay valid
        for pos in positions.iter().rev() {
            state.remove_at(*pos);
        }
        Ok(positions.len())
    }

    /// Execute a query with optional `$query`/`$orderby` wrapping, skip,
    /// limit (negative means "first |limit|"), and projection.
    pub fn handle_query(
        &self,
        query: &Value,
        skip: i64,
        limit: i64,
        projection: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let (filter, order_by) = match query.as_object() {
            Some(obj) if obj.contains_key("$query") => (
                obj.get("$query").cloned().unwrap_or_else(|| json!({})),
                obj.get("$orderby").cloned(),
            ),
            _ => (query.clone(), None),
        };

        let state = self.state.read();
        let mut docs = Vec::new();
        for doc in &state.documents {
            if matches_filter(doc, &filter)? {
                docs.push(doc.clone());
            }
        }
        drop(state);

        if let Some(order_by) = order_by {
            if order_by.is_object() {
                sort_documents(&mut docs, &order_by);
            }
        }
        if skip > 0 {
            docs.drain(..(skip as usize).min(docs.len()));
        }
        let effective_limit = limit.unsigned_abs() as usize;
        if limit != 0 && docs.len() > effective_limit {
            docs.truncate(effective_limit);
        }
        if let Some(projection) = projection {
            if projection.is_object() {
                docs = docs
                    .iter()
                    .map(|doc| apply_projection(doc, projection))
                    .collect();
            }
        }
        Ok(docs)
    }

    /// Materialized snapshot of every document.
    pub fn query_all(&self) -> Vec<Value> {
        self.state.read().documents.clone()
    }

    /// `distinct` command: the set of values the key takes across
    /// matching documents, in first-seen order.
    pub fn handle_distinct(&self, params: &Value) -> Result<Value> {
        let key = params
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ServerError::Exception("no key provided for distinct".to_string()))?
            .to_string();
        let query = params.get("query").cloned().unwrap_or_else(|| json!({}));

        let state = self.state.read();
        let mut values: Vec<Value> = Vec::new();
        for doc in &state.documents {
            if !matches_filter(doc, &query)? {
                continue;
            }
            if let Some(value) = get_path(doc, &key) {
                if !values.iter().any(|seen| values_equal(seen, value)) {
                    values.push(value.clone());
                }
            }
        }
        Ok(json!({"values": values, "ok": 1}))
    }

    /// `findAndModify`: select one document (honoring `sort`), then
    /// remove it or update it, optionally upserting.
    pub fn find_and_modify(&self, params: &Value) -> Result<Value> {
        let query = params.get("query").cloned().unwrap_or_else(|| json!({}));
        let sort = params.get("sort").filter(|s| s.is_object());
        let return_new = is_true(params.get("new"));
        let upsert = is_true(params.get("upsert"));
        let fields = params.get("fields").filter(|f| f.is_object());

        let mut state = self.state.write();
        let mut positions = state.find_positions(&query)?;
        if let Some(sort) = sort {
            let spec: Vec<(String, bool)> = sort
                .as_object()
                .unwrap()
                .iter()
                .map(|(f, d)| (f.clone(), d.as_f64().map(|d| d < 0.0).unwrap_or(false)))
                .collect();
            positions.sort_by(|a, b| {
                for (field, descending) in &spec {
                    let ordering = compare_for_sort(
                        get_path(&state.documents[*a], field),
                        get_path(&state.documents[*b], field),
                    );
                    if ordering != Ordering::Equal {
                        return if *descending { ordering.reverse() } else { ordering };
                    }
                }
                Ordering::Equal
            });
        }

        let project = |value: Value| -> Value {
            match fields {
                Some(fields) if !value.is_null() => apply_projection(&value, fields),
                _ => value,
            }
        };

        if is_true(params.get("remove")) {
            return Ok(match positions.first() {
                Some(&pos) => {
                    let removed = state.remove_at(pos);
                    json!({
                        "lastErrorObject": {"n": 1},
                        "value": project(removed),
                        "ok": 1,
                    })
                }
                None => json!({
                    "lastErrorObject": {"n": 0},
                    "value": Value::Null,
                    "ok": 1,
                }),
            });
        }

        let update = params
            .get("update")
            .ok_or_else(|| ServerError::Exception("need remove or update".to_string()))?;

        match positions.first() {
            Some(&pos) => {
                let old_doc = state.documents[pos].clone();
                let (new_doc, modified) = apply_update(&old_doc, update)?;
                if modified {
                    state.replace_at(pos, new_doc.clone())?;
                }
                let value = if return_new { new_doc } else { old_doc };
                Ok(json!({
                    "lastErrorObject": {"updatedExisting": true, "n": 1},
                    "value": project(value),
                    "ok": 1,
                }))
            }
            None if upsert => {
                let doc = state.upsert_one(&query, update)?;
                let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
                let value = if return_new { project(doc) } else { Value::Null };
                Ok(json!({
                    "lastErrorObject": {"updatedExisting": false, "n": 1, "upserted": id},
                    "value": value,
                    "ok": 1,
                }))
            }
            None => Ok(json!({
                "lastErrorObject": {"updatedExisting": false, "n": 0},
                "value": Value::Null,
                "ok": 1,
            })),
        }
    }

    /// Register a unique index, backfilling it from the stored
    /// documents. Re-adding an index with the same name is a no-op.
    pub fn add_index(&self, index: crate::index::UniqueIndex) -> Result<()> {
        let mut state = self.state.write();
        if state.indexes.iter().any(|i| i.name() == index.name()) {
            return Ok(());
        }
        let namespace = state.full_name();
        let mut index = index;
        for doc in &state.documents {
            index.add(doc, &namespace)?;
        }
        state.indexes.push(index);
        Ok(())
    }

    /// `collstats`-shaped statistics document.
    pub fn get_stats(&self) -> Value {
        let state = self.state.read();
        let count = state.documents.len();
        let size: usize = state.documents.iter().map(document_size).sum();
        let avg_obj_size = if count > 0 {
            size as f64 / count as f64
        } else {
            0.0
        };

        let mut index_sizes = Map::new();
        for index in &state.indexes {
            index_sizes.insert(index.name().to_string(), json!(index.size_bytes()));
        }

        json!({
            "ns": state.full_name(),
            "count": count,
            "size": size,
            "avgObjSize": avg_obj_size,
            "numExtents": 0,
            "nindexes": state.indexes.len(),
            "indexSize": index_sizes,
            "ok": 1,
        })
    }

    /// `validate`-shaped report. The in-memory store has nothing that
    /// can go structurally wrong, so it always validates.
    pub fn validate(&self) -> Value {
        let state = self.state.read();
        let size: usize = state.documents.iter().map(document_size).sum();
        json!({
            "ns": state.full_name(),
            "nrecords": state.documents.len(),
            "datasize": size,
            "nIndexes": state.indexes.len(),
            "valid": true,
            "errors": [],
            "ok": 1,
        })
    }

    /// Rebind this collection to a new database and name.
    pub fn rename_to(&self, database_name: &str, new_name: &str) {
        let mut state = self.state.write();
        state.database_name = database_name.to_string();
        state.name = new_name.to_string();
    }
}
