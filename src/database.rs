// src/database.rs
// The database core: collection catalog, command router, per-channel
// error history, write handlers and bootstrap

use crate::aggregation::Aggregation;
use crate::backend::Backend;
use crate::collection::Collection;
use crate::document::{cursor_response, get_i64, is_true, mark_okay, okay, ID_FIELD};
use crate::error::{Result, ServerError};
use crate::index::IndexKey;
use crate::last_error::{ChannelId, LastResults};
use crate::{log_debug, log_error, log_info, log_trace, log_warn};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Longest allowed collection name, in bytes.
pub const MAX_NS_LENGTH: usize = 128;

const NAMESPACES_COLLECTION_NAME: &str = "system.namespaces";
const INDEXES_COLLECTION_NAME: &str = "system.indexes";
const SYSTEM_PREFIX: &str = "system.";

#[derive(Debug, Deserialize)]
struct UpdateSpec {
    q: Value,
    u: Value,
    #[serde(default)]
    multi: bool,
    #[serde(default)]
    upsert: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteSpec {
    q: Value,
    limit: i64,
}

/// A logical database: the owner of a collection namespace and of the
/// per-channel error histories of every client talking to it.
///
/// `collections_by_name` supports concurrent single-key access; compound
/// catalog transitions (create, drop, move, resolve-or-create) serialize
/// on `catalog_lock` so the map and `system.namespaces` stay consistent.
pub struct Database {
    name: String,
    backend: Arc<dyn Backend>,
    collections_by_name: RwLock<HashMap<String, Arc<Collection>>>,
    namespaces: Arc<Collection>,
    indexes: Mutex<Option<Arc<Collection>>>,
    last_results: LastResults,
    catalog_lock: Mutex<()>,
}

impl Database {
    /// Open a database against a backend, replaying any persisted
    /// `system.namespaces` / `system.indexes` content.
    pub fn open(name: &str, backend: Arc<dyn Backend>) -> Result<Arc<Database>> {
        if name.is_empty() {
            return Err(ServerError::Exception(
                "database name must not be empty".to_string(),
            ));
        }

        let namespaces =
            backend.open_or_create_collection(name, NAMESPACES_COLLECTION_NAME, Some("name"));
        let database = Arc::new(Database {
            name: name.to_string(),
            backend,
            collections_by_name: RwLock::new(HashMap::new()),
            namespaces: Arc::clone(&namespaces),
            indexes: Mutex::new(None),
            last_results: LastResults::new(),
            catalog_lock: Mutex::new(()),
        });
        database
            .collections_by_name
            .write()
            .insert(NAMESPACES_COLLECTION_NAME.to_string(), namespaces);
        database.initialize()?;
        Ok(database)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.collections_by_name.read().is_empty()
    }

    // ========== BOOTSTRAP ==========

    /// Rehydrate collection handles and indexes from persisted
    /// `system.*` collections. A fresh database starts empty here.
    fn initialize(&self) -> Result<()> {
        if self.namespaces.count() == 0 {
            return Ok(());
        }

        let _guard = self.catalog_lock.lock();
        let mut indexes_has_namespace = false;
        for namespace in self.namespaces.query_all() {
            let full_name = namespace
                .get("name")
                .and_then(|name| name.as_str())
                .ok_or_else(|| {
                    ServerError::Internal(format!("malformed namespace document: {}", namespace))
                })?;
            log_debug!("opening {}", full_name);
            let collection_name = self.extract_collection_name(full_name)?;
            if collection_name == INDEXES_COLLECTION_NAME {
                indexes_has_namespace = true;
                continue;
            }
            let collection =
                self.backend
                    .open_or_create_collection(&self.name, &collection_name, Some(ID_FIELD));
            self.collections_by_name
                .write()
                .insert(collection_name.clone(), collection);
            log_debug!("opened collection '{}'", collection_name);
        }

        let index_collection =
            self.backend
                .open_or_create_collection(&self.name, INDEXES_COLLECTION_NAME, None);
        if indexes_has_namespace {
            self.collections_by_name
                .write()
                .insert(INDEXES_COLLECTION_NAME.to_string(), Arc::clone(&index_collection));
        }
        *self.indexes.lock() = Some(Arc::clone(&index_collection));
        for description in index_collection.query_all() {
            self.open_or_create_index_locked(&description)?;
        }
        Ok(())
    }

    // ========== CATALOG ==========

    fn check_collection_name(collection_name: &str) -> Result<()> {
        if collection_name.len() > MAX_NS_LENGTH {
            return Err(ServerError::command(
                10080,
                format!("ns name too long, max size is {}", MAX_NS_LENGTH),
            ));
        }
        if collection_name.is_empty() {
            return Err(ServerError::command(
                16256,
                format!("Invalid ns [{}]", collection_name),
            ));
        }
        Ok(())
    }

    /// Look up a collection after validating its name. With
    /// `throw_if_missing`, an absent collection is an error.
    pub fn resolve_collection(
        &self,
        collection_name: &str,
        throw_if_missing: bool,
    ) -> Result<Option<Arc<Collection>>> {
        Self::check_collection_name(collection_name)?;
        let collection = self.collections_by_name.read().get(collection_name).cloned();
        if collection.is_none() && throw_if_missing {
            return Err(ServerError::NoSuchCollection(collection_name.to_string()));
        }
        Ok(collection)
    }

    fn require_collection(&self, collection_name: &str) -> Result<Arc<Collection>> {
        self.resolve_collection(collection_name, true)?
            .ok_or_else(|| ServerError::NoSuchCollection(collection_name.to_string()))
    }

    /// Resolve a collection, creating it if unknown. Serialized so two
    /// concurrent writers create at most one collection.
    pub fn resolve_or_create_collection(&self, collection_name: &str) -> Result<Arc<Collection>> {
        let _guard = self.catalog_lock.lock();
        self.resolve_or_create_locked(collection_name)
    }

    fn resolve_or_create_locked(&self, collection_name: &str) -> Result<Arc<Collection>> {
        if let Some(collection) = self.resolve_collection(collection_name, false)? {
            return Ok(collection);
        }
        self.create_collection_locked(collection_name)
    }

    fn create_collection_locked(&self, collection_name: &str) -> Result<Arc<Collection>> {
        Self::check_collection_name(collection_name)?;
        if collection_name.contains('$') {
            return Err(ServerError::command(
                10093,
                "cannot insert into reserved $ collection",
            ));
        }

        let collection =
            self.backend
                .open_or_create_collection(&self.name, collection_name, Some(ID_FIELD));
        self.add_namespace(&collection)?;

        let index_description = json!({
            "name": "_id_",
            "ns": collection.full_name(),
            "key": { ID_FIELD: 1 },
        });
        self.add_index_locked(&index_description)?;

        log_info!("created collection {}", collection.full_name());
        Ok(collection)
    }

    fn add_namespace(&self, collection: &Arc<Collection>) -> Result<()> {
        self.collections_by_name
            .write()
            .insert(collection.collection_name(), Arc::clone(collection));
        self.namespaces
            .insert_documents(&[json!({"name": collection.full_name()})])?;
        Ok(())
    }

    /// Remove a collection from the catalog and delete its namespace
    /// document. Returns the removed handle, if any.
    pub fn unregister_collection(
        &self,
        collection_name: &str,
    ) -> Result<Option<Arc<Collection>>> {
        let _guard = self.catalog_lock.lock();
        self.unregister_locked(collection_name)
    }

    fn unregister_locked(&self, collection_name: &str) -> Result<Option<Arc<Collection>>> {
        let removed = self.collections_by_name.write().remove(collection_name);
        if let Some(collection) = &removed {
            self.namespaces
                .delete_documents(&json!({"name": collection.full_name()}), 1)?;
        }
        Ok(removed)
    }

    /// Atomically take a collection from another database, rename it and
    /// register it here with a fresh namespace document.
    pub fn move_collection(
        &self,
        old_database: &Database,
        collection: &Arc<Collection>,
        new_collection_name: &str,
    ) -> Result<()> {
        let _guard = self.catalog_lock.lock();
        let old_name = collection.collection_name();
        if std::ptr::eq(self, old_database) {
            self.unregister_locked(&old_name)?;
        } else {
            old_database.unregister_collection(&old_name)?;
        }
        collection.rename_to(&self.name, new_collection_name);
        self.collections_by_name
            .write()
            .insert(new_collection_name.to_string(), Arc::clone(collection));
        self.namespaces
            .insert_documents(&[json!({"name": collection.full_name()})])?;
        Ok(())
    }

    /// Unregister every collection. Used when the backend drops the
    /// whole database.
    pub fn drop_all_collections(&self) -> Result<()> {
        log_debug!("dropping {}", self.name);
        let _guard = self.catalog_lock.lock();
        let names: Vec<String> = self.collections_by_name.read().keys().cloned().collect();
        for collection_name in names {
            self.unregister_locked(&collection_name)?;
        }
        Ok(())
    }

    fn extract_collection_name(&self, namespace: &str) -> Result<String> {
        let prefix = format!("{}.", self.name);
        namespace
            .strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| ServerError::Internal(format!("invalid namespace: {}", namespace)))
    }

    // ========== INDEXES ==========

    fn get_or_create_indexes_collection(&self) -> Result<Arc<Collection>> {
        let mut guard = self.indexes.lock();
        if let Some(collection) = guard.as_ref() {
            return Ok(Arc::clone(collection));
        }
        let collection =
            self.backend
                .open_or_create_collection(&self.name, INDEXES_COLLECTION_NAME, None);
        self.add_namespace(&collection)?;
        *guard = Some(Arc::clone(&collection));
        Ok(collection)
    }

    fn count_indexes(&self) -> usize {
        self.indexes
            .lock()
            .as_ref()
            .map(|collection| collection.count())
            .unwrap_or(0)
    }

    /// Register an index: open it on its collection, then append its
    /// description to `system.indexes`.
    fn add_index_locked(&self, description: &Value) -> Result<()> {
        self.open_or_create_index_locked(description)?;
        self.get_or_create_indexes_collection()?
            .insert_documents(&[description.clone()])?;
        Ok(())
    }

    fn open_or_create_index_locked(&self, description: &Value) -> Result<()> {
        let namespace = description
            .get("ns")
            .and_then(|ns| ns.as_str())
            .ok_or_else(|| {
                ServerError::Exception(format!("index description has no ns: {}", description))
            })?;
        let collection_name = self.extract_collection_name(namespace)?;
        let collection = self.resolve_or_create_locked(&collection_name)?;

        let key = description
            .get("key")
            .and_then(|key| key.as_object())
            .ok_or_else(|| {
                ServerError::Exception(format!("index description has no key: {}", description))
            })?;

        if key.len() == 1 && key.contains_key(ID_FIELD) {
            let ascending = is_ascending(key.get(ID_FIELD).unwrap());
            collection.add_index(self.backend.open_or_create_unique_index(
                &collection_name,
                vec![IndexKey::new(ID_FIELD, ascending)],
            ))?;
            log_info!("adding unique _id index for collection {}", collection_name);
        } else if is_true(description.get("unique")) {
            let keys: Vec<IndexKey> = key
                .iter()
                .map(|(field, direction)| IndexKey::new(field.clone(), is_ascending(direction)))
                .collect();
            log_info!(
                "adding unique index {:?} for collection {}",
                keys,
                collection_name
            );
            collection.add_index(
                self.backend
                    .open_or_create_unique_index(&collection_name, keys),
            )?;
        } else {
            // non-unique non-_id indexes are not implemented; replay must
            // not fail on them
            log_warn!(
                "adding a non-unique non-_id index with key {:?} is not yet implemented",
                key
            );
        }
        Ok(())
    }

    // ========== COMMAND ROUTER ==========

    /// Dispatch a named command. Matching is case-insensitive; every
    /// command except the error-history queries first appends the
    /// pending sentinel to the channel's history.
    pub fn handle_command(
        &self,
        channel: ChannelId,
        command: &str,
        params: &Value,
    ) -> Result<Value> {
        // getlasterror must not clear the last error
        if command.eq_ignore_ascii_case("getlasterror") {
            return self.command_get_last_error(channel, command, params);
        } else if command.eq_ignore_ascii_case("getpreverror") {
            return Ok(self.last_results.get_prev_error(channel));
        } else if command.eq_ignore_ascii_case("reseterror") {
            return Ok(self.last_results.reset(channel));
        }

        self.last_results.clear_last_status(channel);

        match command.to_ascii_lowercase().as_str() {
            "find" => self.command_find(command, params),
            "insert" => self.command_insert(channel, command, params),
            "update" => self.command_update(channel, command, params),
            "delete" => self.command_delete(channel, command, params),
            "create" => self.command_create(command, params),
            "createindexes" => self.command_create_indexes(params),
            "count" => self.command_count(command, params),
            "aggregate" => self.command_aggregate(command, params),
            "distinct" => {
                let collection = self.require_collection(&collection_name_from(params, command)?)?;
                collection.handle_distinct(params)
            }
            "drop" => self.command_drop(params),
            "dropdatabase" => self.command_drop_database(),
            "dbstats" => Ok(self.command_database_stats()),
            "collstats" => {
                let collection = self.require_collection(&collection_name_from(params, command)?)?;
                Ok(collection.get_stats())
            }
            "validate" => {
                let collection = self.require_collection(&collection_name_from(params, command)?)?;
                Ok(collection.validate())
            }
            "findandmodify" => {
                let collection_name = collection_name_from(params, command)?;
                let collection = self.resolve_or_create_collection(&collection_name)?;
                collection.find_and_modify(params)
            }
            "listcollections" => Ok(self.list_collections()),
            "listindexes" => self.list_indexes(),
            _ => {
                log_error!("unknown command: {} {}", command, params);
                Err(ServerError::NoSuchCommand(command.to_string()))
            }
        }
    }

    // ========== READ / ADMIN HANDLERS ==========

    fn command_find(&self, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;

        let mut documents = Vec::new();
        if let Some(collection) = self.resolve_collection(&collection_name, false)? {
            let skip = get_i64(params, "skip", 0);
            let limit = get_i64(params, "limit", 0);
            let projection = params.get("projection");

            let mut query_selector = Map::new();
            query_selector.insert(
                "$query".to_string(),
                params.get("filter").cloned().unwrap_or_else(|| json!({})),
            );
            if let Some(sort) = params.get("sort") {
                query_selector.insert("$orderby".to_string(), sort.clone());
            }
            documents =
                collection.handle_query(&Value::Object(query_selector), skip, limit, projection)?;
        }

        Ok(cursor_response(
            &format!("{}.{}", self.name, collection_name),
            documents,
        ))
    }

    fn command_count(&self, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;
        let mut response = Map::new();
        match self.resolve_collection(&collection_name, false)? {
            None => {
                response.insert("n".to_string(), json!(0));
            }
            Some(collection) => {
                let query = params.get("query").cloned().unwrap_or_else(|| json!({}));
                let limit = get_i64(params, "limit", -1);
                let skip = get_i64(params, "skip", 0);
                let n = collection.count_query(&query, skip, limit)?;
                response.insert("n".to_string(), json!(n));
            }
        }
        let mut response = Value::Object(response);
        mark_okay(&mut response);
        Ok(response)
    }

    fn command_aggregate(&self, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;

        let cursor = params.get("cursor").ok_or_else(|| {
            ServerError::command(
                9,
                "The 'cursor' option is required, except for aggregate with the explain argument",
            )
        })?;
        if cursor.as_object().map(|c| !c.is_empty()).unwrap_or(true) {
            return Err(ServerError::Exception(
                "Non-empty cursor is not yet implemented".to_string(),
            ));
        }

        let pipeline = params
            .get("pipeline")
            .and_then(|p| p.as_array())
            .ok_or_else(|| ServerError::Exception("no pipeline given".to_string()))?;
        let aggregation = Aggregation::parse(pipeline)?;

        let input = match self.resolve_collection(&collection_name, false)? {
            Some(collection) => collection.query_all(),
            None => Vec::new(),
        };
        let result = aggregation.run(input)?;

        Ok(cursor_response(
            &format!("{}.{}", self.name, collection_name),
            result,
        ))
    }

    fn command_create(&self, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;

        if is_true(params.get("capped")) {
            return Err(ServerError::Exception(
                "Creating capped collections is not yet implemented".to_string(),
            ));
        }
        if let Some(auto_index_id) = params.get("autoIndexId") {
            if !auto_index_id.is_null() && !is_true(Some(auto_index_id)) {
                return Err(ServerError::Exception(
                    "Disabling autoIndexId is not yet implemented".to_string(),
                ));
            }
        }

        let _guard = self.catalog_lock.lock();
        if self.resolve_collection(&collection_name, false)?.is_some() {
            return Err(ServerError::command_named(
                48,
                "NamespaceExists",
                "collection already exists",
            ));
        }
        self.create_collection_locked(&collection_name)?;
        Ok(okay())
    }

    fn command_create_indexes(&self, params: &Value) -> Result<Value> {
        let num_indexes_before = self.count_indexes();

        let descriptions = params
            .get("indexes")
            .and_then(|indexes| indexes.as_array())
            .ok_or_else(|| ServerError::Exception("no indexes given".to_string()))?;
        {
            let _guard = self.catalog_lock.lock();
            for description in descriptions {
                self.add_index_locked(description)?;
            }
        }

        Ok(json!({
            "numIndexesBefore": num_indexes_before,
            "numIndexesAfter": self.count_indexes(),
            "ok": 1,
        }))
    }

    fn command_drop(&self, params: &Value) -> Result<Value> {
        let collection_name = params
            .get("drop")
            .and_then(|name| name.as_str())
            .ok_or_else(|| ServerError::Exception("no collection name given".to_string()))?;

        let _guard = self.catalog_lock.lock();
        let collection = self
            .collections_by_name
            .write()
            .remove(collection_name)
            .ok_or_else(|| ServerError::Silent("ns not found".to_string()))?;

        let full_name = collection.full_name();
        let num_indexes_was = collection.num_indexes();
        self.namespaces
            .delete_documents(&json!({"name": full_name}), 1)?;
        let indexes_collection = self.indexes.lock().clone();
        if let Some(indexes_collection) = indexes_collection {
            indexes_collection.delete_documents(&json!({"ns": full_name}), 0)?;
        }

        Ok(json!({
            "nIndexesWas": num_indexes_was,
            "ns": full_name,
            "ok": 1,
        }))
    }

    fn command_drop_database(&self) -> Result<Value> {
        self.backend.drop_database(&self.name)?;
        Ok(json!({"dropped": self.name, "ok": 1}))
    }

    fn command_database_stats(&self) -> Value {
        let mut objects = 0i64;
        let mut data_size = 0i64;
        let mut index_size = 0i64;
        for collection in self.collections_by_name.read().values() {
            let stats = collection.get_stats();
            objects += get_i64(&stats, "count", 0);
            data_size += get_i64(&stats, "size", 0);
            if let Some(index_sizes) = stats.get("indexSize").and_then(|sizes| sizes.as_object()) {
                for (_, bytes) in index_sizes {
                    index_size += bytes.as_i64().unwrap_or(0);
                }
            }
        }
        let average_object_size = if objects > 0 {
            data_size as f64 / objects as f64
        } else {
            0.0
        };

        json!({
            "db": self.name,
            "collections": self.namespaces.count(),
            "objects": objects,
            "avgObjSize": average_object_size,
            "dataSize": data_size,
            "storageSize": self.backend.storage_size(),
            "numExtents": 0,
            "indexes": self.count_indexes(),
            "indexSize": index_size,
            "fileSize": self.backend.file_size(),
            "nsSizeMB": 0,
            "ok": 1,
        })
    }

    fn list_collections(&self) -> Value {
        let mut first_batch = Vec::new();
        for namespace in self.namespaces.query_all() {
            if let Some(full_name) = namespace.get("name").and_then(|name| name.as_str()) {
                let collection_name = full_name
                    .strip_prefix(&format!("{}.", self.name))
                    .unwrap_or(full_name);
                first_batch.push(json!({
                    "name": collection_name,
                    "options": {},
                }));
            }
        }
        cursor_response(&format!("{}.$cmd.listCollections", self.name), first_batch)
    }

    fn list_indexes(&self) -> Result<Value> {
        let indexes = self.require_collection(INDEXES_COLLECTION_NAME)?;
        Ok(cursor_response(
            &format!("{}.$cmd.listIndexes", self.name),
            indexes.query_all(),
        ))
    }

    // ========== ERROR-HISTORY COMMANDS ==========

    fn command_get_last_error(
        &self,
        channel: ChannelId,
        command: &str,
        params: &Value,
    ) -> Result<Value> {
        let keys: Vec<&String> = params
            .as_object()
            .map(|obj| obj.keys().collect())
            .unwrap_or_default();
        let mut it = keys.iter();
        match it.next() {
            Some(first) if first.eq_ignore_ascii_case(command) => {}
            _ => {
                return Err(ServerError::Internal(format!(
                    "unexpected getlasterror document: {}",
                    params
                )))
            }
        }
        for sub_command in it {
            match sub_command.as_str() {
                // write-concern arguments are accepted and ignored
                "w" | "fsync" => {}
                other => {
                    return Err(ServerError::Exception(format!(
                        "unknown subcommand: {}",
                        other
                    )))
                }
            }
        }
        Ok(self.last_results.get_last_error(channel))
    }

    // ========== WRITE HANDLERS ==========

    fn command_insert(&self, channel: ChannelId, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;
        let ordered = is_true(params.get("ordered"));
        log_trace!("ordered: {}", ordered);

        let documents = params
            .get("documents")
            .and_then(|docs| docs.as_array())
            .ok_or_else(|| ServerError::Exception("no documents given".to_string()))?;

        let mut write_errors: Vec<Value> = Vec::new();
        let mut n = 0i64;
        for document in documents {
            match self.insert_documents(channel, &collection_name, std::slice::from_ref(document))
            {
                Ok(_) => n += 1,
                Err(error @ ServerError::Command { .. }) => {
                    let mut entry = json!({
                        "index": n,
                        "errmsg": error.message(),
                        "code": error.code(),
                    });
                    if let Some(code_name) = error.code_name() {
                        entry
                            .as_object_mut()
                            .unwrap()
                            .insert("codeName".to_string(), json!(code_name));
                    }
                    write_errors.push(entry);
                }
                Err(other) => return Err(other),
            }
        }

        let mut result = json!({"n": n});
        if !write_errors.is_empty() {
            result
                .as_object_mut()
                .unwrap()
                .insert("writeErrors".to_string(), json!(write_errors));
        }
        mark_okay(&mut result);
        Ok(result)
    }

    fn command_update(&self, channel: ChannelId, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;
        let ordered = is_true(params.get("ordered"));
        log_trace!("ordered: {}", ordered);

        let updates = params
            .get("updates")
            .and_then(|updates| updates.as_array())
            .ok_or_else(|| ServerError::Exception("no updates given".to_string()))?;

        let mut n_matched = 0i64;
        let mut n_modified = 0i64;
        let mut upserts: Vec<Value> = Vec::new();
        for update_obj in updates {
            let spec: UpdateSpec = serde_json::from_value(update_obj.clone())
                .map_err(|e| ServerError::Exception(format!("invalid update: {}", e)))?;
            let result = self.update_documents(
                channel,
                &collection_name,
                &spec.q,
                &spec.u,
                spec.multi,
                spec.upsert,
            )?;
            if let Some(id) = result.get("upserted") {
                upserts.push(json!({"index": upserts.len(), ID_FIELD: id.clone()}));
            }
            n_matched += get_i64(&result, "n", 0);
            n_modified += get_i64(&result, "nModified", 0);
        }

        let mut response = json!({"n": n_matched, "nModified": n_modified});
        if !upserts.is_empty() {
            response
                .as_object_mut()
                .unwrap()
                .insert("upserted".to_string(), json!(upserts));
        }
        mark_okay(&mut response);
        self.last_results.put_last_result(channel, response.clone())?;
        Ok(response)
    }

    fn command_delete(&self, channel: ChannelId, command: &str, params: &Value) -> Result<Value> {
        let collection_name = collection_name_from(params, command)?;
        let ordered = is_true(params.get("ordered"));
        log_trace!("ordered: {}", ordered);

        let deletes = params
            .get("deletes")
            .and_then(|deletes| deletes.as_array())
            .ok_or_else(|| ServerError::Exception("no deletes given".to_string()))?;

        let mut n = 0i64;
        for delete_obj in deletes {
            let spec: DeleteSpec = serde_json::from_value(delete_obj.clone())
                .map_err(|e| ServerError::Exception(format!("invalid delete: {}", e)))?;
            let result = self.delete_documents(channel, &collection_name, &spec.q, spec.limit)?;
            n += get_i64(&result, "n", 0);
        }

        let mut response = json!({"n": n});
        mark_okay(&mut response);
        Ok(response)
    }

    /// Insert documents on behalf of a channel, recording the outcome in
    /// its error history.
    fn insert_documents(
        &self,
        channel: ChannelId,
        collection_name: &str,
        documents: &[Value],
    ) -> Result<Value> {
        self.last_results.clear_last_status(channel);
        match self.try_insert(collection_name, documents) {
            Ok(result) => {
                self.last_results.put_last_result(channel, result.clone())?;
                Ok(result)
            }
            Err(error) => {
                if matches!(error, ServerError::Command { .. }) {
                    self.last_results.put_last_error(channel, &error)?;
                }
                Err(error)
            }
        }
    }

    fn try_insert(&self, collection_name: &str, documents: &[Value]) -> Result<Value> {
        if collection_name.starts_with(SYSTEM_PREFIX) {
            return Err(ServerError::command(
                16459,
                "attempt to insert in system namespace",
            ));
        }
        let collection = self.resolve_or_create_collection(collection_name)?;
        let n = collection.insert_documents(documents)?;
        Ok(json!({"n": n}))
    }

    /// Update documents on behalf of a channel. Errors are recorded in
    /// the channel's history; the success result is left for the caller
    /// to record.
    fn update_documents(
        &self,
        channel: ChannelId,
        collection_name: &str,
        selector: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Value> {
        self.last_results.clear_last_status(channel);
        match self.try_update(collection_name, selector, update, multi, upsert) {
            Ok(result) => Ok(result),
            Err(error) => {
                self.last_results.put_last_error(channel, &error)?;
                Err(error)
            }
        }
    }

    fn try_update(
        &self,
        collection_name: &str,
        selector: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Value> {
        if collection_name.starts_with(SYSTEM_PREFIX) {
            return Err(ServerError::command(10156, "cannot update system collection"));
        }
        let collection = self.resolve_or_create_collection(collection_name)?;
        collection.update_documents(selector, update, multi, upsert)
    }

    /// Delete documents on behalf of a channel, recording the outcome in
    /// its error history.
    fn delete_documents(
        &self,
        channel: ChannelId,
        collection_name: &str,
        selector: &Value,
        limit: i64,
    ) -> Result<Value> {
        self.last_results.clear_last_status(channel);
        match self.try_delete(collection_name, selector, limit) {
            Ok(result) => {
                self.last_results.put_last_result(channel, result.clone())?;
                Ok(result)
            }
            Err(error) => {
                if matches!(error, ServerError::Command { .. }) {
                    self.last_results.put_last_error(channel, &error)?;
                }
                Err(error)
            }
        }
    }

    fn try_delete(&self, collection_name: &str, selector: &Value, limit: i64) -> Result<Value> {
        if collection_name.starts_with(SYSTEM_PREFIX) {
            return Err(ServerError::command(
                12050,
                "cannot delete from system namespace",
            ));
        }
        let n = match self.resolve_collection(collection_name, false)? {
            Some(collection) => collection.delete_documents(selector, limit)?,
            None => 0,
        };
        Ok(json!({"n": n}))
    }

    // ========== LEGACY WIRE ENTRY POINTS ==========

    /// Legacy OP_QUERY path: resolve and query, or an empty batch for an
    /// unknown collection.
    pub fn handle_query(
        &self,
        channel: ChannelId,
        collection_name: &str,
        query: &Value,
        skip: i64,
        limit: i64,
        projection: Option<&Value>,
    ) -> Result<Vec<Value>> {
        self.last_results.clear_last_status(channel);
        match self.resolve_collection(collection_name, false)? {
            Some(collection) => collection.handle_query(query, skip, limit, projection),
            None => Ok(Vec::new()),
        }
    }

    /// Legacy OP_INSERT path. Inserts into `system.indexes` register
    /// indexes instead of storing raw documents; errors on ordinary
    /// inserts are logged and swallowed.
    pub fn handle_insert(
        &self,
        channel: ChannelId,
        collection_name: &str,
        documents: &[Value],
    ) -> Result<()> {
        if collection_name == INDEXES_COLLECTION_NAME {
            let _guard = self.catalog_lock.lock();
            for description in documents {
                self.add_index_locked(description)?;
            }
            return Ok(());
        }
        match self.insert_documents(channel, collection_name, documents) {
            Ok(_) => Ok(()),
            Err(error @ ServerError::Internal(_)) => Err(error),
            Err(error) => {
                log_error!("failed to insert into {}: {}", collection_name, error);
                Ok(())
            }
        }
    }

    /// Legacy OP_UPDATE path: the per-update result is recorded; errors
    /// are logged and swallowed.
    pub fn handle_update(
        &self,
        channel: ChannelId,
        collection_name: &str,
        selector: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<()> {
        match self.update_documents(channel, collection_name, selector, update, multi, upsert) {
            Ok(result) => {
                self.last_results.put_last_result(channel, result)?;
                Ok(())
            }
            Err(error @ ServerError::Internal(_)) => Err(error),
            Err(error) => {
                log_error!("failed to update {}: {}", collection_name, error);
                Ok(())
            }
        }
    }

    /// Legacy OP_DELETE path: single-remove caps at one document; errors
    /// are logged and swallowed.
    pub fn handle_delete(
        &self,
        channel: ChannelId,
        collection_name: &str,
        selector: &Value,
        single_remove: bool,
    ) -> Result<()> {
        let limit = if single_remove { 1 } else { 0 };
        match self.delete_documents(channel, collection_name, selector, limit) {
            Ok(_) => Ok(()),
            Err(error @ ServerError::Internal(_)) => Err(error),
            Err(error) => {
                log_error!("failed to delete from {}: {}", collection_name, error);
                Ok(())
            }
        }
    }

    /// Channel closed: drop its error history.
    pub fn handle_close(&self, channel: ChannelId) {
        self.last_results.remove_channel(channel);
    }
}

fn is_ascending(direction: &Value) -> bool {
    direction.as_f64() == Some(1.0)
}

fn collection_name_from(params: &Value, command: &str) -> Result<String> {
    params
        .get(command)
        .and_then(|name| name.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ServerError::Exception(format!("no collection name given in {}", params))
        })
}
