//! Record operations
//!
//! Every mutating call follows the same order: validate, intern strings and
//! allocate, update the field indexes, then persist the record bytes. The
//! record's write lock is held from the index updates to the final write, so
//! a reader holding the read lock never sees bytes that disagree with the
//! index entries of the same record.
//!
//! Each public call appends its log line first; the `apply_*` variants are
//! what replay runs.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::database::Database;
use super::errors::{DbError, DbResult};
use super::registry::SchemaRuntime;
use crate::index::lookup_key;
use crate::schema::{
    document_values, json_kind, FieldType, FieldValue, MapType, Scalar, SchemaError,
    SchemaValidator, StoredRecord,
};
use crate::storage::StorageError;

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InsertResult {
    pub address: u64,
    /// Master key of the record, generated when the document had none
    pub master: Option<Uuid>,
}

impl InsertResult {
    pub fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "master": self.master.map(|m| m.hyphenated().to_string()),
        })
    }
}

/// Gives `document` a master key when its schema has one and the document
/// carries none (absent, null or the nil UUID). Returns the key in effect.
fn fill_master(runtime: &SchemaRuntime, document: &mut Value) -> Option<Uuid> {
    let index = runtime.interface().master_index()?;
    let name = runtime.interface().fields[index].name.clone();
    let object = document.as_object_mut()?;
    let current = match object.get(&name) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(Uuid::parse_str(text).ok()?),
        // Left for validation to reject.
        Some(_) => return None,
    };
    match current {
        Some(uuid) if !uuid.is_nil() => Some(uuid),
        _ => {
            let fresh = Uuid::new_v4();
            object.insert(name, Value::String(fresh.hyphenated().to_string()));
            Some(fresh)
        }
    }
}

/// The master key a document names, if it names a usable one.
fn document_master(runtime: &SchemaRuntime, document: &Value) -> Option<Uuid> {
    let index = runtime.interface().master_index()?;
    let text = document.get(&runtime.interface().fields[index].name)?.as_str()?;
    Uuid::parse_str(text).ok().filter(|uuid| !uuid.is_nil())
}

fn not_found(runtime: &SchemaRuntime, what: impl std::fmt::Display) -> DbError {
    DbError::RecordNotFound(format!("{} {}", runtime.name(), what))
}

fn count_mismatch() -> StorageError {
    StorageError::data_corruption("string count changed while mapping a value")
}

impl Database {
    // ---- strings ----

    /// Borrows a handle for every reference string in `value`.
    async fn intern(&self, value: FieldValue<String>) -> DbResult<FieldValue<u64>> {
        let mut handles = Vec::new();
        for text in value.strings() {
            match self.strings.borrow(text).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.release_handles(&handles).await;
                    return Err(e.into());
                }
            }
        }
        let mut handles = handles.into_iter();
        Ok(value.try_map_strings(&mut |_| handles.next().ok_or_else(count_mismatch))?)
    }

    /// Best-effort release used when unwinding a failed call.
    async fn release_handles(&self, handles: &[u64]) {
        for handle in handles {
            let _ = self.strings.release(*handle).await;
        }
    }

    async fn release_value(&self, value: &FieldValue<u64>) -> DbResult<()> {
        for handle in value.strings() {
            self.strings.release(*handle).await?;
        }
        Ok(())
    }

    /// Replaces every handle in `value` by its text.
    async fn resolve(&self, value: &FieldValue<u64>) -> DbResult<FieldValue<String>> {
        let mut texts = Vec::new();
        for handle in value.strings() {
            texts.push(self.strings.read(*handle).await?);
        }
        let mut texts = texts.into_iter();
        Ok(value
            .clone()
            .try_map_strings(&mut |_| texts.next().ok_or_else(count_mismatch))?)
    }

    // ---- records ----

    /// Decodes a live record. The caller holds the record lock.
    async fn read_stored(&self, runtime: &SchemaRuntime, address: u64) -> DbResult<StoredRecord> {
        if !runtime.allocator.is_live(address).await? {
            return Err(not_found(runtime, format!("at {}", address)));
        }
        let bytes = self
            .core
            .file
            .read_bytes(address, runtime.layout.record_size() as usize)
            .await?;
        Ok(runtime.layout.decode(&bytes)?)
    }

    async fn to_document(&self, runtime: &SchemaRuntime, stored: &StoredRecord) -> DbResult<Value> {
        let mut object = Map::new();
        for (i, field, _) in runtime.layout.fields() {
            object.insert(field.name.clone(), self.resolve(&stored[i]).await?.to_json());
        }
        Ok(Value::Object(object))
    }

    async fn read_document(&self, runtime: &SchemaRuntime, address: u64) -> DbResult<Value> {
        let _guard = self.core.locks.record.read(address).await;
        let stored = self.read_stored(runtime, address).await?;
        self.to_document(runtime, &stored).await
    }

    /// Index key for a query value, or `None` when a string in it was never
    /// interned and so cannot match any record.
    async fn query_key(
        &self,
        runtime: &SchemaRuntime,
        index: usize,
        value: &Value,
    ) -> DbResult<Option<Vec<u8>>> {
        let field = runtime.layout.field(index);
        let probe = if field.field_type == FieldType::Char {
            let text = value.as_str().ok_or_else(|| {
                SchemaError::invalid_value(
                    &field.name,
                    format!("char buffer, got {}", json_kind(value)),
                )
            })?;
            FieldValue::Chars(text.to_string())
        } else {
            FieldValue::Scalar(
                Scalar::from_json(field.field_type, value)
                    .map_err(|reason| SchemaError::invalid_value(&field.name, reason))?,
            )
        };

        let mut handles = Vec::new();
        for text in probe.strings() {
            match self.strings.find(text).await? {
                Some(handle) => handles.push(handle),
                None => return Ok(None),
            }
        }
        let mut handles = handles.into_iter();
        let stored = probe.try_map_strings(&mut |_| handles.next().ok_or_else(count_mismatch))?;
        Ok(Some(lookup_key(field, &stored)?))
    }

    async fn resolve_master(&self, runtime: &SchemaRuntime, master: Uuid) -> DbResult<Option<u64>> {
        let index = runtime
            .interface()
            .master_index()
            .ok_or_else(|| DbError::field_not_found(runtime.name(), "<master>"))?;
        Ok(self
            .field_index(runtime, index)
            .get(master.as_bytes())
            .await?)
    }

    /// The user schema whose blocks contain `address`.
    async fn owner_of(&self, address: u64) -> DbResult<Arc<SchemaRuntime>> {
        for runtime in self.user_runtimes().await? {
            if runtime.allocator.owns_address(address).await? {
                return Ok(runtime);
            }
        }
        Err(DbError::AddressNotOwned(address))
    }

    // ---- insert ----

    /// Validates and stores `document`, generating its master key when the
    /// schema has one and the document carries none.
    pub async fn insert(&self, type_name: &str, document: &Value) -> DbResult<InsertResult> {
        let runtime = self.runtime(type_name).await?;
        let mut document = document.clone();
        fill_master(&runtime, &mut document);
        self.append_log(|| format!("insert {} {}", type_name, document))
            .await?;
        self.apply_insert(type_name, &document).await
    }

    pub(super) async fn apply_insert(
        &self,
        type_name: &str,
        document: &Value,
    ) -> DbResult<InsertResult> {
        let runtime = self.runtime(type_name).await?;
        let mut document = document.clone();
        let master = fill_master(&runtime, &mut document);
        SchemaValidator::new(runtime.interface()).validate_document(&document)?;

        let values = document_values(runtime.interface(), &document)?;
        let mut stored: StoredRecord = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            let interned = match value {
                Some(value) => self.intern(value).await,
                None => Err(SchemaError::invalid_value(&runtime.layout.field(i).name, "missing").into()),
            };
            match interned {
                Ok(value) => stored.push(value),
                Err(e) => {
                    self.unwind(&stored).await;
                    return Err(e);
                }
            }
        }
        let bytes = match runtime.layout.encode(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.unwind(&stored).await;
                return Err(e.into());
            }
        };

        let address = match runtime.allocator.allocate_record().await {
            Ok(address) => address,
            Err(e) => {
                self.unwind(&stored).await;
                return Err(e.into());
            }
        };
        let _guard = self.core.locks.record.write(address).await;
        if let Err(e) = self.store_new(&runtime, address, &stored, &bytes).await {
            self.rollback_insert(&runtime, address, &stored).await;
            return Err(e);
        }
        Ok(InsertResult { address, master })
    }

    async fn store_new(
        &self,
        runtime: &SchemaRuntime,
        address: u64,
        stored: &StoredRecord,
        bytes: &[u8],
    ) -> DbResult<()> {
        for i in runtime.mapped_fields() {
            self.field_index(runtime, i).add(address, &stored[i]).await?;
        }
        self.core.file.write_bytes(address, bytes).await?;
        Ok(())
    }

    /// Undoes a half-stored insert: index entries, the slot and the string
    /// references. Removing an entry that was never added is a no-op.
    async fn rollback_insert(&self, runtime: &SchemaRuntime, address: u64, stored: &StoredRecord) {
        for i in runtime.mapped_fields() {
            let _ = self.field_index(runtime, i).remove(address, &stored[i]).await;
        }
        let _ = runtime.allocator.remove_record(address).await;
        self.unwind(stored).await;
    }

    async fn unwind(&self, values: &[FieldValue<u64>]) {
        for value in values {
            let handles: Vec<u64> = value.strings().into_iter().copied().collect();
            self.release_handles(&handles).await;
        }
    }

    // ---- update ----

    /// Replaces the fields present in `document` on the record at `address`.
    /// Fields the document leaves out keep their stored value. A master key
    /// cannot be changed.
    pub async fn update(&self, type_name: &str, address: u64, document: &Value) -> DbResult<u64> {
        self.append_log(|| format!("update address {} {} {}", type_name, address, document))
            .await?;
        self.apply_update(type_name, address, document).await
    }

    /// Updates the record whose master key the document carries.
    pub async fn update_by_master(&self, type_name: &str, document: &Value) -> DbResult<u64> {
        self.append_log(|| format!("update master {} {}", type_name, document))
            .await?;
        self.apply_update_by_master(type_name, document).await
    }

    pub(super) async fn apply_update_by_master(
        &self,
        type_name: &str,
        document: &Value,
    ) -> DbResult<u64> {
        let runtime = self.runtime(type_name).await?;
        let master = document_master(&runtime, document).ok_or_else(|| {
            let field = runtime
                .interface()
                .master_index()
                .map(|i| runtime.interface().fields[i].name.clone())
                .unwrap_or_else(|| "<master>".to_string());
            SchemaError::invalid_value(field, "update by master needs a non-nil master key")
        })?;
        let address = self
            .resolve_master(&runtime, master)
            .await?
            .ok_or_else(|| not_found(&runtime, format!("with master {}", master)))?;
        self.apply_update(type_name, address, document).await
    }

    pub(super) async fn apply_update(
        &self,
        type_name: &str,
        address: u64,
        document: &Value,
    ) -> DbResult<u64> {
        let runtime = self.runtime(type_name).await?;
        let changes = document.as_object().ok_or_else(|| {
            SchemaError::invalid_value(type_name, format!("object, got {}", json_kind(document)))
        })?;
        let master_index = runtime.interface().master_index();

        let _guard = self.core.locks.record.write(address).await;
        let old = self.read_stored(&runtime, address).await?;
        let mut old_values = Vec::with_capacity(old.len());
        for value in &old {
            old_values.push(self.resolve(value).await?);
        }

        let old_master = master_index.and_then(|i| match &old_values[i] {
            FieldValue::Scalar(Scalar::Uuid(uuid)) => Some(*uuid),
            _ => None,
        });
        let mut merged = Map::new();
        for (i, field, _) in runtime.layout.fields() {
            merged.insert(field.name.clone(), old_values[i].to_json());
        }
        for (key, value) in changes {
            let is_master = master_index
                .map(|i| runtime.interface().fields[i].name == *key)
                .unwrap_or(false);
            if is_master {
                let requested = value.as_str().and_then(|s| Uuid::parse_str(s).ok());
                let unchanged = value.is_null()
                    || matches!(requested, Some(uuid) if uuid.is_nil() || Some(uuid) == old_master);
                if unchanged {
                    continue;
                }
                return Err(SchemaError::invalid_value(key, "master key cannot change").into());
            }
            merged.insert(key.clone(), value.clone());
        }
        let merged = Value::Object(merged);
        SchemaValidator::new(runtime.interface()).validate_document(&merged)?;
        let values = document_values(runtime.interface(), &merged)?;

        let mut stored: StoredRecord = Vec::with_capacity(old.len());
        let mut changed = Vec::new();
        for (i, value) in values.into_iter().enumerate() {
            match value {
                Some(value) if value != old_values[i] => match self.intern(value).await {
                    Ok(value) => {
                        stored.push(value);
                        changed.push(i);
                    }
                    Err(e) => {
                        self.unwind_changed(&stored, &changed).await;
                        return Err(e);
                    }
                },
                _ => stored.push(old[i].clone()),
            }
        }
        let bytes = match runtime.layout.encode(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.unwind_changed(&stored, &changed).await;
                return Err(e.into());
            }
        };

        for &i in &changed {
            if runtime.mappings[i] == 0 {
                continue;
            }
            let index = self.field_index(&runtime, i);
            let moved = match index.remove(address, &old[i]).await {
                Ok(()) => index.add(address, &stored[i]).await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                self.restore_indexes(&runtime, address, &old, &stored, &changed)
                    .await;
                self.unwind_changed(&stored, &changed).await;
                return Err(e.into());
            }
        }
        for &i in &changed {
            self.release_value(&old[i]).await?;
        }
        self.core.file.write_bytes(address, &bytes).await?;
        Ok(address)
    }

    /// Puts the index entries of the changed fields back on their old values.
    async fn restore_indexes(
        &self,
        runtime: &SchemaRuntime,
        address: u64,
        old: &StoredRecord,
        stored: &StoredRecord,
        changed: &[usize],
    ) {
        for &i in changed {
            if runtime.mappings[i] == 0 {
                continue;
            }
            let index = self.field_index(runtime, i);
            let _ = index.remove(address, &stored[i]).await;
            let _ = index.remove(address, &old[i]).await;
            let _ = index.add(address, &old[i]).await;
        }
    }

    async fn unwind_changed(&self, stored: &[FieldValue<u64>], changed: &[usize]) {
        for &i in changed {
            self.unwind(std::slice::from_ref(&stored[i])).await;
        }
    }

    // ---- delete ----

    /// Deletes the record at `address`, dropping its index entries and string
    /// references before freeing the slot.
    pub async fn delete(&self, type_name: &str, address: u64) -> DbResult<u64> {
        self.append_log(|| format!("delete address {} {}", type_name, address))
            .await?;
        self.apply_delete(type_name, address).await
    }

    pub async fn delete_by_master(&self, type_name: &str, master: Uuid) -> DbResult<u64> {
        self.append_log(|| format!("delete master {} {}", type_name, master.hyphenated()))
            .await?;
        self.apply_delete_by_master(type_name, master).await
    }

    pub(super) async fn apply_delete_by_master(
        &self,
        type_name: &str,
        master: Uuid,
    ) -> DbResult<u64> {
        let runtime = self.runtime(type_name).await?;
        let address = self
            .resolve_master(&runtime, master)
            .await?
            .ok_or_else(|| not_found(&runtime, format!("with master {}", master)))?;
        self.apply_delete(type_name, address).await
    }

    pub(super) async fn apply_delete(&self, type_name: &str, address: u64) -> DbResult<u64> {
        let runtime = self.runtime(type_name).await?;
        let _guard = self.core.locks.record.write(address).await;
        let old = self.read_stored(&runtime, address).await?;
        for i in runtime.mapped_fields() {
            self.field_index(&runtime, i).remove(address, &old[i]).await?;
        }
        for value in &old {
            self.release_value(value).await?;
        }
        runtime.allocator.remove_record(address).await?;
        Ok(address)
    }

    // ---- queries ----

    pub async fn find_by_master(&self, type_name: &str, master: Uuid) -> DbResult<Value> {
        self.append_log(|| format!("query master {} {}", type_name, master.hyphenated()))
            .await?;
        self.apply_find_by_master(type_name, master).await
    }

    pub(super) async fn apply_find_by_master(&self, type_name: &str, master: Uuid) -> DbResult<Value> {
        let runtime = self.runtime(type_name).await?;
        let address = self
            .resolve_master(&runtime, master)
            .await?
            .ok_or_else(|| not_found(&runtime, format!("with master {}", master)))?;
        self.read_document(&runtime, address).await
    }

    /// Address of the record with master key `master`, without logging.
    pub async fn address_by_master(&self, type_name: &str, master: Uuid) -> DbResult<Option<u64>> {
        let runtime = self.runtime(type_name).await?;
        self.resolve_master(&runtime, master).await
    }

    /// Looks a record up by a unique (`Master` or `Index`) field.
    pub async fn find_by_index(&self, type_name: &str, field: &str, value: &Value) -> DbResult<Value> {
        self.append_log(|| format!("query index {} {} {}", type_name, field, value))
            .await?;
        self.apply_find_by_index(type_name, field, value).await
    }

    pub(super) async fn apply_find_by_index(
        &self,
        type_name: &str,
        field: &str,
        value: &Value,
    ) -> DbResult<Value> {
        let runtime = self.runtime(type_name).await?;
        let index = runtime.mapped_field(field, &[MapType::Master, MapType::Index])?;
        let missing = || not_found(&runtime, format!("with {} = {}", field, value));
        let key = self
            .query_key(&runtime, index, value)
            .await?
            .ok_or_else(missing)?;
        let address = self
            .field_index(&runtime, index)
            .get(&key)
            .await?
            .ok_or_else(missing)?;
        self.read_document(&runtime, address).await
    }

    /// Records whose `IndexArray` field contains `value`.
    pub async fn get_record_addresses_by_index_array(
        &self,
        type_name: &str,
        field: &str,
        value: &Value,
    ) -> DbResult<Vec<u64>> {
        self.append_log(|| format!("query index {} {} {}", type_name, field, value))
            .await?;
        self.collection_addresses(type_name, field, value, &[MapType::IndexArray])
            .await
    }

    /// Records whose hash-set mapped field equals `value`.
    pub async fn get_record_addresses_by_index_hash_set(
        &self,
        type_name: &str,
        field: &str,
        value: &Value,
    ) -> DbResult<Vec<u64>> {
        self.append_log(|| format!("query index {} {} {}", type_name, field, value))
            .await?;
        self.collection_addresses(
            type_name,
            field,
            value,
            &[MapType::IndexHashSet, MapType::IndexSmallHashSet],
        )
        .await
    }

    pub(super) async fn collection_addresses(
        &self,
        type_name: &str,
        field: &str,
        value: &Value,
        roles: &[MapType],
    ) -> DbResult<Vec<u64>> {
        let runtime = self.runtime(type_name).await?;
        let index = runtime.mapped_field(field, roles)?;
        match self.query_key(&runtime, index, value).await? {
            Some(key) => Ok(self.field_index(&runtime, index).addresses(&key).await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn find_by_address(&self, type_name: &str, address: u64) -> DbResult<Value> {
        self.append_log(|| format!("query address {} {}", type_name, address))
            .await?;
        self.apply_find_by_address(type_name, address).await
    }

    pub(super) async fn apply_find_by_address(&self, type_name: &str, address: u64) -> DbResult<Value> {
        let runtime = self.runtime(type_name).await?;
        self.read_document(&runtime, address).await
    }

    /// Reads the record at `address` without knowing its schema.
    pub async fn find_by_address_any(&self, address: u64) -> DbResult<Value> {
        self.append_log(|| format!("query address * {}", address))
            .await?;
        self.apply_find_by_address_any(address).await
    }

    pub(super) async fn apply_find_by_address_any(&self, address: u64) -> DbResult<Value> {
        let runtime = self.owner_of(address).await?;
        self.read_document(&runtime, address).await
    }

    /// Every live record of a schema with its address, in address order.
    pub async fn scan(&self, type_name: &str) -> DbResult<Vec<(u64, Value)>> {
        let runtime = self.runtime(type_name).await?;
        let mut out = Vec::new();
        for address in runtime.allocator.used_addresses().await? {
            match self.read_document(&runtime, address).await {
                Ok(document) => out.push((address, document)),
                // Deleted since the slot list was taken.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        out.sort_by_key(|(address, _)| *address);
        Ok(out)
    }

    /// Number of live records of a schema.
    pub async fn count(&self, type_name: &str) -> DbResult<u64> {
        let runtime = self.runtime(type_name).await?;
        Ok(runtime.allocator.used_count().await?)
    }
}
