//! objectdb - an embedded, schema-driven object store in one growable file
//!
//! Records of registered schemas live in fixed-size slots of 1 MiB blocks.
//! Fields can be indexed (unique keys, arrays, hash sets) and reference
//! strings are interned once and shared by refcount. Every call can be
//! appended to an operation log and replayed into a fresh file.
//!
//! ```no_run
//! use objectdb::config::StoreConfig;
//! use objectdb::database::Database;
//! use objectdb::schema::{Field, FieldType, MapType, ObjectInterface};
//! use serde_json::json;
//!
//! # async fn demo() -> objectdb::database::DbResult<()> {
//! let db = Database::open(StoreConfig::new("people.obj")).await?;
//! db.register_interface(ObjectInterface::new(
//!     "Person",
//!     vec![
//!         Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
//!         Field::new("Name", FieldType::Char).array(32).mapped(MapType::Index),
//!         Field::new("Age", FieldType::Int32),
//!     ],
//! ))
//! .await?;
//! let inserted = db.insert("Person", &json!({"Name": "Alice", "Age": 30})).await?;
//! let alice = db.find_by_index("Person", "Name", &json!("Alice")).await?;
//! # let _ = (inserted, alice);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod database;
pub mod index;
pub mod observability;
pub mod schema;
pub mod storage;
pub mod strings;
pub mod sync;
