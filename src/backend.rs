// src/backend.rs
// Persistence binding consumed by the database core

use crate::collection::Collection;
use crate::database::Database;
use crate::error::Result;
use crate::index::{self, IndexKey, UniqueIndex};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The persistence seam of the core.
///
/// The database asks its backend for collection handles and unique
/// indexes and tells it when a whole database goes away. A persistent
/// implementation would return handles bound to durable storage;
/// [`MemoryBackend`] hands out fresh in-memory ones.
pub trait Backend: Send + Sync {
    /// Open (or create) the named collection of a database. `id_field`
    /// is the field whose values must stay unique, if any.
    fn open_or_create_collection(
        &self,
        database_name: &str,
        collection_name: &str,
        id_field: Option<&str>,
    ) -> Arc<Collection>;

    /// Index factory used for `_id` and unique compound indexes.
    fn open_or_create_unique_index(
        &self,
        collection_name: &str,
        keys: Vec<IndexKey>,
    ) -> UniqueIndex {
        index::open_or_create_unique_index(collection_name, keys)
    }

    /// Drop a database and everything in it.
    fn drop_database(&self, database_name: &str) -> Result<()>;

    fn file_size(&self) -> i64 {
        0
    }

    fn storage_size(&self) -> i64 {
        0
    }
}

/// Fully in-memory backend: owns the database map and creates ephemeral
/// collections on demand.
pub struct MemoryBackend {
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend {
            databases: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a database, opening it on first use.
    pub fn database(self: &Arc<Self>, name: &str) -> Result<Arc<Database>> {
        if let Some(database) = self.databases.read().get(name) {
            return Ok(Arc::clone(database));
        }
        let database = Database::open(name, Arc::clone(self) as Arc<dyn Backend>)?;
        let mut databases = self.databases.write();
        Ok(Arc::clone(
            databases.entry(name.to_string()).or_insert(database),
        ))
    }

    pub fn list_database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }
}

impl Backend for MemoryBackend {
    fn open_or_create_collection(
        &self,
        database_name: &str,
        collection_name: &str,
        id_field: Option<&str>,
    ) -> Arc<Collection> {
        Arc::new(Collection::new(database_name, collection_name, id_field))
    }

    fn drop_database(&self, database_name: &str) -> Result<()> {
        let removed = self.databases.write().remove(database_name);
        if let Some(database) = removed {
            database.drop_all_collections()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_database_handle_is_shared() {
        let backend = MemoryBackend::new();
        let first = backend.database("testdb").unwrap();
        let second = backend.database("testdb").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.list_database_names(), vec!["testdb".to_string()]);
    }

    #[test]
    fn test_drop_database_removes_it() {
        let backend = MemoryBackend::new();
        let database = backend.database("testdb").unwrap();
        database.resolve_or_create_collection("c").unwrap();

        backend.drop_database("testdb").unwrap();
        assert!(backend.list_database_names().is_empty());
        assert!(database.is_empty());

        // dropping a database that is already gone is fine
        backend.drop_database("testdb").unwrap();
    }

    #[test]
    fn test_memory_collections_are_ephemeral() {
        let backend = MemoryBackend::new();
        let first = backend.open_or_create_collection("testdb", "c", Some("_id"));
        first.insert_documents(&[json!({"_id": 1})]).unwrap();
        let second = backend.open_or_create_collection("testdb", "c", Some("_id"));
        assert_eq!(second.count(), 0);
    }

    #[test]
    fn test_empty_database_name_rejected() {
        let backend = MemoryBackend::new();
        assert!(backend.database("").is_err());
    }
}
