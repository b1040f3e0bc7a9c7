//! Record Lifecycle Tests
//!
//! End-to-end checks through the public `Database` API:
//! - insert then find returns the stored document
//! - a missing master key is generated
//! - updating an indexed field moves its index entry
//! - delete drops index entries and exactly one string reference per field
//! - rejected schemas and documents leave no trace
//! - concurrent inserts never lose or share a slot

use std::collections::HashSet;
use std::sync::Arc;

use objectdb::config::StoreConfig;
use objectdb::database::Database;
use objectdb::schema::{Field, FieldType, MapType, ObjectInterface};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

// =============================================================================
// Test Utilities
// =============================================================================

fn person() -> ObjectInterface {
    ObjectInterface::new(
        "Person",
        vec![
            Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
            Field::new("Name", FieldType::Char).array(32).mapped(MapType::Index),
            Field::new("Age", FieldType::Int32),
        ],
    )
}

fn visit() -> ObjectInterface {
    ObjectInterface::new(
        "Visit",
        vec![
            Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
            Field::new("City", FieldType::String),
            Field::new("When", FieldType::DateTime),
        ],
    )
}

fn trip() -> ObjectInterface {
    ObjectInterface::new(
        "Trip",
        vec![
            Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
            Field::new("City", FieldType::String).mapped(MapType::IndexHashSet),
            Field::new("Region", FieldType::String).mapped(MapType::IndexSmallHashSet),
            Field::new("Stops", FieldType::String)
                .array(4)
                .mapped(MapType::IndexArray),
        ],
    )
}

async fn open_db(dir: &TempDir) -> Database {
    let mut config = StoreConfig::new(dir.path().join("store.obj"));
    config.log_level = "error".to_string();
    let db = Database::open(config).await.unwrap();
    db.register_interface(person()).await.unwrap();
    db.register_interface(visit()).await.unwrap();
    db.register_interface(trip()).await.unwrap();
    db
}

/// Reference count of `text`, 0 once its entry is gone.
async fn refs(db: &Database, text: &str) -> u32 {
    match db.strings().find(text).await.unwrap() {
        Some(handle) => db.strings().refcount(handle).await.unwrap(),
        None => 0,
    }
}

// =============================================================================
// Person scenario
// =============================================================================

/// Insert, update and delete one person, checking each step by lookup.
#[tokio::test]
async fn test_person_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let inserted = db
        .insert("Person", &json!({"Name": "Alice", "Age": 30}))
        .await
        .unwrap();
    let id = inserted.master.expect("master generated");

    let found = db.find_by_master("Person", id).await.unwrap();
    assert_eq!(
        found,
        json!({"Id": id.hyphenated().to_string(), "Name": "Alice", "Age": 30})
    );

    db.update("Person", inserted.address, &json!({"Age": 31}))
        .await
        .unwrap();
    let found = db.find_by_master("Person", id).await.unwrap();
    assert_eq!(found["Age"], json!(31));
    assert_eq!(
        db.find_by_index("Person", "Name", &json!("Alice"))
            .await
            .unwrap()["Id"],
        json!(id.hyphenated().to_string())
    );

    db.delete_by_master("Person", id).await.unwrap();
    let err = db.find_by_master("Person", id).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.code(), "OBJ_RECORD_NOT_FOUND");
}

/// Two inserts without a master get two distinct, non-nil keys.
#[tokio::test]
async fn test_generated_masters_are_distinct() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let a = db
        .insert("Person", &json!({"Name": "A", "Age": 1}))
        .await
        .unwrap();
    let b = db
        .insert("Person", &json!({"Id": null, "Name": "B", "Age": 2}))
        .await
        .unwrap();
    let (a, b) = (a.master.unwrap(), b.master.unwrap());
    assert_ne!(a, b);
    assert!(!a.is_nil() && !b.is_nil());
}

// =============================================================================
// Index consistency
// =============================================================================

/// Changing an Index field from A to B: lookup by A misses, lookup by B hits.
#[tokio::test]
async fn test_index_follows_update() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let inserted = db
        .insert("Person", &json!({"Name": "Before", "Age": 5}))
        .await
        .unwrap();
    db.update("Person", inserted.address, &json!({"Name": "After"}))
        .await
        .unwrap();

    assert!(db
        .find_by_index("Person", "Name", &json!("Before"))
        .await
        .unwrap_err()
        .is_not_found());
    let found = db
        .find_by_index("Person", "Name", &json!("After"))
        .await
        .unwrap();
    assert_eq!(found["Age"], json!(5));
}

/// Unindexed fields cannot be queried through an index.
#[tokio::test]
async fn test_find_by_unindexed_field_fails() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let err = db
        .find_by_index("Person", "Age", &json!(30))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OBJ_FIELD_NOT_FOUND");
}

// =============================================================================
// Reference strings
// =============================================================================

/// Equal strings share one entry; delete drops exactly one reference.
#[tokio::test]
async fn test_delete_releases_one_reference() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let doc = json!({"City": "Trondheim", "When": "2024-05-01T10:30:00Z"});
    let first = db.insert("Visit", &doc).await.unwrap();
    db.insert("Visit", &doc).await.unwrap();

    let handle = db.strings().find("Trondheim").await.unwrap().unwrap();
    assert_eq!(db.strings().refcount(handle).await.unwrap(), 2);

    db.delete("Visit", first.address).await.unwrap();
    assert_eq!(db.strings().refcount(handle).await.unwrap(), 1);
    assert!(db
        .find_by_address("Visit", first.address)
        .await
        .unwrap_err()
        .is_not_found());
}

/// Indexed string fields hold one reference per record field, like plain ones.
#[tokio::test]
async fn test_indexed_strings_count_one_reference_per_field() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let doc = json!({"City": "Oslo", "Region": "East", "Stops": ["Oslo", "Bergen"]});

    let first = db.insert("Trip", &doc).await.unwrap();
    assert_eq!(refs(&db, "Oslo").await, 2);
    assert_eq!(refs(&db, "East").await, 1);
    assert_eq!(refs(&db, "Bergen").await, 1);

    let second = db.insert("Trip", &doc).await.unwrap();
    assert_eq!(refs(&db, "Oslo").await, 4);
    assert_eq!(refs(&db, "East").await, 2);
    assert_eq!(refs(&db, "Bergen").await, 2);

    db.delete("Trip", first.address).await.unwrap();
    assert_eq!(refs(&db, "Oslo").await, 2);
    assert_eq!(refs(&db, "East").await, 1);
    assert_eq!(refs(&db, "Bergen").await, 1);
    assert_eq!(
        db.get_record_addresses_by_index_hash_set("Trip", "City", &json!("Oslo"))
            .await
            .unwrap(),
        vec![second.address]
    );
    assert_eq!(
        db.get_record_addresses_by_index_array("Trip", "Stops", &json!("Bergen"))
            .await
            .unwrap(),
        vec![second.address]
    );

    db.update("Trip", second.address, &json!({"Stops": ["Bergen"]}))
        .await
        .unwrap();
    assert_eq!(refs(&db, "Oslo").await, 1);
    assert_eq!(refs(&db, "Bergen").await, 1);

    db.delete("Trip", second.address).await.unwrap();
    for text in ["Oslo", "East", "Bergen"] {
        assert_eq!(refs(&db, text).await, 0, "{} still referenced", text);
    }
    assert!(db
        .get_record_addresses_by_index_hash_set("Trip", "Region", &json!("East"))
        .await
        .unwrap()
        .is_empty());
}

/// Rejected inserts and updates change neither counts, indexes nor records.
#[tokio::test]
async fn test_rejected_calls_leave_no_trace() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let kept = db
        .insert("Trip", &json!({"City": "Oslo", "Region": "East", "Stops": ["Oslo"]}))
        .await
        .unwrap();

    let bad = json!({"City": "Rome", "Region": 7, "Stops": ["Rome"]});
    assert!(db.insert("Trip", &bad).await.is_err());
    assert!(db
        .update("Trip", kept.address, &json!({"City": "Rome", "Stops": [1]}))
        .await
        .is_err());

    assert_eq!(db.count("Trip").await.unwrap(), 1);
    assert_eq!(refs(&db, "Rome").await, 0);
    assert_eq!(refs(&db, "Oslo").await, 2);
    assert_eq!(
        db.get_record_addresses_by_index_hash_set("Trip", "City", &json!("Oslo"))
            .await
            .unwrap(),
        vec![kept.address]
    );

    let err = db
        .insert("Person", &json!({"Name": "a\0b", "Age": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OBJ_SCHEMA_VALIDATION_FAILED");
    assert_eq!(db.count("Person").await.unwrap(), 0);
}

/// Schemas whose keys or sizes cannot be stored are refused at registration.
#[tokio::test]
async fn test_unstorable_schemas_are_refused() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let wide = ObjectInterface::new(
        "Doc",
        vec![
            Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
            Field::new("Tag", FieldType::Char)
                .array(300)
                .mapped(MapType::IndexSmallHashSet),
        ],
    );
    let err = db.register_interface(wide).await.unwrap_err();
    assert_eq!(err.code(), "OBJ_UNSUPPORTED_TYPE");
    assert!(db.insert("Doc", &json!({"Tag": "x"})).await.is_err());

    let huge = ObjectInterface::from_json(
        r#"{"full_name":"A","fields":[{"name":"A","type":"int64","array_length":4000000000}]}"#,
    )
    .unwrap();
    let err = db.register_interface(huge).await.unwrap_err();
    assert_eq!(err.code(), "OBJ_INVALID_SCHEMA");

    let spaced = ObjectInterface::new("B", vec![Field::new("Two Words", FieldType::Int32)]);
    let err = db.register_interface(spaced).await.unwrap_err();
    assert_eq!(err.code(), "OBJ_INVALID_SCHEMA");
}

/// An update that leaves a string unchanged keeps its handle and count.
#[tokio::test]
async fn test_unchanged_string_keeps_reference() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let inserted = db
        .insert(
            "Visit",
            &json!({"City": "Bergen", "When": "2024-05-01T10:30:00Z"}),
        )
        .await
        .unwrap();
    let handle = db.strings().find("Bergen").await.unwrap().unwrap();

    db.update(
        "Visit",
        inserted.address,
        &json!({"City": "Bergen", "When": "2025-01-01T00:00:00Z"}),
    )
    .await
    .unwrap();
    assert_eq!(db.strings().find("Bergen").await.unwrap(), Some(handle));
    assert_eq!(db.strings().refcount(handle).await.unwrap(), 1);

    db.update("Visit", inserted.address, &json!({"City": "Oslo"}))
        .await
        .unwrap();
    assert_eq!(db.strings().find("Bergen").await.unwrap(), None);
    let found = db.find_by_address("Visit", inserted.address).await.unwrap();
    assert_eq!(found["City"], json!("Oslo"));
    assert_eq!(found["When"], json!("2025-01-01T00:00:00Z"));
}

// =============================================================================
// Persistence and concurrency
// =============================================================================

/// Records, indexes and strings survive close and reopen.
#[tokio::test]
async fn test_reopen_keeps_records() {
    let dir = TempDir::new().unwrap();
    let id = Uuid::new_v4();
    {
        let db = open_db(&dir).await;
        db.insert(
            "Person",
            &json!({"Id": id.to_string(), "Name": "Kept", "Age": 77}),
        )
        .await
        .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(StoreConfig::new(dir.path().join("store.obj")))
        .await
        .unwrap();
    assert_eq!(
        db.find_by_index("Person", "Name", &json!("Kept"))
            .await
            .unwrap()["Id"],
        json!(id.to_string())
    );
    assert_eq!(db.count("Person").await.unwrap(), 1);
}

/// Parallel inserts land in distinct slots and are all findable.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir).await);

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let db = Arc::clone(&db);
        tasks.push(tokio::spawn(async move {
            let mut addresses = Vec::new();
            for i in 0..25 {
                let doc = json!({"Name": format!("w{}-{}", worker, i), "Age": i});
                addresses.push(db.insert("Person", &doc).await.unwrap().address);
            }
            addresses
        }));
    }

    let mut all = HashSet::new();
    for task in tasks {
        for address in task.await.unwrap() {
            assert!(all.insert(address), "address {} handed out twice", address);
        }
    }
    assert_eq!(all.len(), 200);
    assert_eq!(db.count("Person").await.unwrap(), 200);

    for worker in 0..8 {
        for i in 0..25 {
            let name = format!("w{}-{}", worker, i);
            let found = db
                .find_by_index("Person", "Name", &json!(name))
                .await
                .unwrap();
            assert_eq!(found["Age"], json!(i));
        }
    }
}
