// Catalog bootstrap tests: replaying persisted system.namespaces and
// system.indexes through a backend that retains collection handles
use ferromongo::{Backend, Collection, Database, Result};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Backend that keeps collection handles alive across database
/// instances, the way a persistent backend keeps data on disk.
struct RetainingBackend {
    collections: RwLock<HashMap<(String, String), Arc<Collection>>>,
}

impl RetainingBackend {
    fn new() -> Arc<RetainingBackend> {
        Arc::new(RetainingBackend {
            collections: RwLock::new(HashMap::new()),
        })
    }
}

impl Backend for RetainingBackend {
    fn open_or_create_collection(
        &self,
        database_name: &str,
        collection_name: &str,
        id_field: Option<&str>,
    ) -> Arc<Collection> {
        let mut collections = self.collections.write();
        let key = (database_name.to_string(), collection_name.to_string());
        Arc::clone(collections.entry(key).or_insert_with(|| {
            Arc::new(Collection::new(database_name, collection_name, id_field))
        }))
    }

    fn drop_database(&self, database_name: &str) -> Result<()> {
        self.collections
            .write()
            .retain(|(database, _), _| database != database_name);
        Ok(())
    }
}

#[test]
fn test_fresh_backend_starts_empty() {
    let backend = RetainingBackend::new();
    let db = Database::open("testdb", backend as Arc<dyn Backend>).unwrap();
    assert!(db.resolve_collection("c", false).unwrap().is_none());
}

#[test]
fn test_reopen_replays_namespaces_and_indexes() {
    let backend = RetainingBackend::new();
    {
        let db = Database::open("testdb", Arc::clone(&backend) as Arc<dyn Backend>).unwrap();
        db.handle_command(
            1,
            "insert",
            &json!({"insert": "c", "documents": [{"_id": 1, "a": "x"}]}),
        )
        .unwrap();
        db.handle_command(
            1,
            "createIndexes",
            &json!({"createIndexes": "c", "indexes": [
                {"name": "a_1", "ns": "testdb.c", "key": {"a": 1}, "unique": true}
            ]}),
        )
        .unwrap();
    }

    // a second database instance over the same backend finds the catalog
    let db = Database::open("testdb", backend as Arc<dyn Backend>).unwrap();
    let collection = db.resolve_collection("c", false).unwrap().unwrap();
    assert_eq!(collection.count(), 1);

    let response = db.handle_command(2, "find", &json!({"find": "c"})).unwrap();
    assert_eq!(
        response["cursor"]["firstBatch"],
        json!([{"_id": 1, "a": "x"}])
    );

    let indexes = db
        .handle_command(2, "listIndexes", &json!({"listIndexes": 1}))
        .unwrap();
    let names: Vec<&str> = indexes["cursor"]["firstBatch"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["_id_", "a_1"]);
}

#[test]
fn test_replay_rebuilds_unique_indexes_from_descriptions() {
    let backend = RetainingBackend::new();

    // seed the system collections the way a prior run would have left them
    let namespaces = backend.open_or_create_collection("testdb", "system.namespaces", Some("name"));
    namespaces
        .insert_documents(&[
            json!({"name": "testdb.c"}),
            json!({"name": "testdb.system.indexes"}),
        ])
        .unwrap();
    let indexes = backend.open_or_create_collection("testdb", "system.indexes", None);
    indexes
        .insert_documents(&[
            json!({"name": "_id_", "ns": "testdb.c", "key": {"_id": 1}}),
            json!({"name": "a_1", "ns": "testdb.c", "key": {"a": 1}, "unique": true}),
            json!({"name": "b_1", "ns": "testdb.c", "key": {"b": 1}}),
        ])
        .unwrap();
    let data = backend.open_or_create_collection("testdb", "c", Some("_id"));
    data.insert_documents(&[json!({"_id": 1, "a": "x"})]).unwrap();

    let db = Database::open("testdb", backend as Arc<dyn Backend>).unwrap();

    // the _id_ and unique indexes are live; the non-unique one was
    // skipped
    let collection = db.resolve_collection("c", false).unwrap().unwrap();
    assert_eq!(collection.num_indexes(), 2);

    let response = db
        .handle_command(
            1,
            "insert",
            &json!({"insert": "c", "documents": [{"_id": 2, "a": "x"}]}),
        )
        .unwrap();
    assert_eq!(response["n"], json!(0));
    assert_eq!(response["writeErrors"][0]["code"], json!(11000));

    let response = db
        .handle_command(
            1,
            "insert",
            &json!({"insert": "c", "documents": [{"_id": 2, "a": "y", "b": "x"}]}),
        )
        .unwrap();
    assert_eq!(response["n"], json!(1));

    // the skipped index stays listed in system.indexes
    let listed = db
        .handle_command(1, "listIndexes", &json!({"listIndexes": 1}))
        .unwrap();
    assert_eq!(listed["cursor"]["firstBatch"].as_array().unwrap().len(), 3);
}

#[test]
fn test_replay_descending_id_index() {
    let backend = RetainingBackend::new();
    let namespaces = backend.open_or_create_collection("testdb", "system.namespaces", Some("name"));
    namespaces
        .insert_documents(&[
            json!({"name": "testdb.c"}),
            json!({"name": "testdb.system.indexes"}),
        ])
        .unwrap();
    let indexes = backend.open_or_create_collection("testdb", "system.indexes", None);
    indexes
        .insert_documents(&[json!({"name": "_id_", "ns": "testdb.c", "key": {"_id": -1}})])
        .unwrap();
    backend.open_or_create_collection("testdb", "c", Some("_id"));

    let db = Database::open("testdb", backend as Arc<dyn Backend>).unwrap();
    let collection = db.resolve_collection("c", false).unwrap().unwrap();
    assert_eq!(collection.num_indexes(), 1);
}

#[test]
fn test_drop_database_discards_retained_state() {
    let backend = RetainingBackend::new();
    {
        let db = Database::open("testdb", Arc::clone(&backend) as Arc<dyn Backend>).unwrap();
        db.handle_command(
            1,
            "insert",
            &json!({"insert": "c", "documents": [{"_id": 1}]}),
        )
        .unwrap();
        db.handle_command(1, "dropDatabase", &json!({"dropDatabase": 1}))
            .unwrap();
    }

    let db = Database::open("testdb", backend as Arc<dyn Backend>).unwrap();
    assert!(db.resolve_collection("c", false).unwrap().is_none());
}
