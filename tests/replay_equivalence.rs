//! Operation Log Replay Tests
//!
//! A database driven directly and a fresh database rebuilt from the first
//! one's operation log must end in the same state, compared by full scan.

use objectdb::config::StoreConfig;
use objectdb::database::{read_lines, Database, LogCommand};
use objectdb::schema::{Field, FieldType, MapType, ObjectInterface};
use serde_json::json;
use tempfile::TempDir;

fn order() -> ObjectInterface {
    ObjectInterface::new(
        "Order",
        vec![
            Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
            Field::new("Code", FieldType::Char).array(16).mapped(MapType::Index),
            Field::new("Customer", FieldType::String).mapped(MapType::IndexHashSet),
            Field::new("Items", FieldType::Int32).array(4).mapped(MapType::IndexArray),
            Field::new("Total", FieldType::Float64),
        ],
    )
}

fn quiet(config: StoreConfig) -> StoreConfig {
    StoreConfig {
        log_level: "error".to_string(),
        ..config
    }
}

/// Drives the first database and returns its scan.
async fn drive(dir: &TempDir) -> Vec<(u64, serde_json::Value)> {
    let config = quiet(
        StoreConfig::new(dir.path().join("source.obj")).with_oplog(dir.path().join("ops.log")),
    );
    let db = Database::open(config).await.unwrap();
    db.register_interface(order()).await.unwrap();

    let mut masters = Vec::new();
    for i in 0..6 {
        let doc = json!({
            "Code": format!("ORD-{}", i),
            "Customer": if i % 2 == 0 { "acme" } else { "globex" },
            "Items": [i, i + 1],
            "Total": i as f64 * 1.5,
        });
        masters.push(db.insert("Order", &doc).await.unwrap());
    }

    db.update(
        "Order",
        masters[1].address,
        &json!({"Customer": "acme", "Total": 99.5}),
    )
    .await
    .unwrap();
    let master = masters[2].master.unwrap();
    db.update_by_master(
        "Order",
        &json!({"Id": master.to_string(), "Code": "ORD-2b"}),
    )
    .await
    .unwrap();
    db.delete("Order", masters[3].address).await.unwrap();
    db.delete_by_master("Order", masters[4].master.unwrap())
        .await
        .unwrap();

    // Queries are logged too and replay as no-ops.
    db.find_by_index("Order", "Code", &json!("ORD-0"))
        .await
        .unwrap();
    db.get_record_addresses_by_index_hash_set("Order", "Customer", &json!("acme"))
        .await
        .unwrap();
    db.find_by_address_any(masters[0].address).await.unwrap();

    // A rejected call is still logged and fails again on replay.
    assert!(db
        .insert("Order", &json!({"Code": "bad", "Customer": "x", "Items": [], "Total": "NaN"}))
        .await
        .is_err());

    let rows = db.scan("Order").await.unwrap();
    db.close().await.unwrap();
    rows
}

#[tokio::test]
async fn test_replay_rebuilds_identical_state() {
    let dir = TempDir::new().unwrap();
    let expected = drive(&dir).await;
    assert_eq!(expected.len(), 4);

    let replica = Database::open(quiet(StoreConfig::new(dir.path().join("replica.obj"))))
        .await
        .unwrap();
    let stats = replica
        .replay_log(&dir.path().join("ops.log"))
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.applied, 1 + 6 + 2 + 2 + 3);

    assert_eq!(replica.scan("Order").await.unwrap(), expected);
    let acme = replica
        .get_record_addresses_by_index_hash_set("Order", "Customer", &json!("acme"))
        .await
        .unwrap();
    assert_eq!(acme.len(), 3);
}

#[tokio::test]
async fn test_log_lines_parse_back() {
    let dir = TempDir::new().unwrap();
    drive(&dir).await;

    let lines = read_lines(&dir.path().join("ops.log")).await.unwrap();
    assert!(lines[0].starts_with("register interface "));
    for line in &lines {
        let command = LogCommand::parse(line).unwrap();
        assert_eq!(&command.to_string(), line);
    }
}
