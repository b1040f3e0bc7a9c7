//! Schema registry
//!
//! The registry is a block-sized hash table at the interface table address,
//! keyed by the CRC32 of the schema name and holding the address of the
//! schema's first meta-record. Names are confirmed against the meta-record
//! header, so no separate key copy is stored.
//!
//! A [`SchemaRuntime`] is the in-memory form of a registered schema: its
//! compiled layout, record allocator and per-field mapping addresses.

use std::future::Future;
use std::sync::Arc;

use super::database::Database;
use super::errors::{DbError, DbResult};
use super::natives::is_native;
use crate::observability::{log_event_with_fields, Event};
use crate::schema::{
    Field, FieldType, MapType, ObjectInterface, RecordLayout, SchemaError,
};
use crate::storage::{
    hash_key, slot_count, DefineEntry, KeyProbe, MetaAllocator, MetaDefineRecord, MetaRecord,
    StorageResult, StoreCore,
};

/// Matches registry values whose meta-record carries `name`.
pub(crate) struct NameProbe<'a> {
    core: &'a StoreCore,
    name: &'a str,
}

impl<'a> NameProbe<'a> {
    pub(crate) fn new(core: &'a StoreCore, name: &'a str) -> Self {
        Self { core, name }
    }
}

impl KeyProbe for NameProbe<'_> {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
        async move {
            let stored = MetaRecord::new(self.core, value).read_name().await?;
            Ok(stored == self.name)
        }
    }
}

/// In-memory form of a registered schema.
pub(crate) struct SchemaRuntime {
    pub(crate) layout: RecordLayout,
    pub(crate) allocator: Arc<MetaAllocator>,
    pub(crate) meta_address: u64,
    /// Mapping address per field; zero for unmapped fields
    pub(crate) mappings: Vec<u64>,
}

impl SchemaRuntime {
    pub(crate) fn name(&self) -> &str {
        self.layout.name()
    }

    pub(crate) fn interface(&self) -> &ObjectInterface {
        self.layout.interface()
    }

    /// Indices of mapped fields.
    pub(crate) fn mapped_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.interface()
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.map_type.is_mapped())
            .map(|(i, _)| i)
    }

    /// Index of `field`, if it is mapped with one of `roles`.
    pub(crate) fn mapped_field(&self, field: &str, roles: &[MapType]) -> DbResult<usize> {
        self.interface()
            .field_index(field)
            .filter(|i| roles.contains(&self.interface().fields[*i].map_type))
            .ok_or_else(|| DbError::field_not_found(self.name(), field))
    }
}

impl Database {
    /// Registers `interface`, logging the call first.
    ///
    /// Registering an identical schema again is a no-op; a different schema
    /// under an existing name fails.
    pub async fn register_interface(&self, interface: ObjectInterface) -> DbResult<()> {
        self.append_log(|| format!("register interface {}", interface.to_json()))
            .await?;
        self.apply_register(interface).await
    }

    pub(super) async fn apply_register(&self, interface: ObjectInterface) -> DbResult<()> {
        interface.check_structure()?;
        let record_size = interface.record_size();
        if slot_count(record_size) == 0 {
            return Err(SchemaError::invalid_schema(
                &interface.full_name,
                format!("record size {} does not fit in a block", record_size),
            )
            .into());
        }

        let name = interface.full_name.clone();
        let _guard = self.core.locks.names.write(name.clone()).await;
        let existing = match self.cached_runtime(&name) {
            Some(runtime) => Some(runtime),
            None => self.load_runtime(&name).await?,
        };
        if let Some(existing) = existing {
            return if existing.interface() == &interface {
                self.cache_runtime(existing);
                Ok(())
            } else {
                Err(DbError::InterfaceExists(name))
            };
        }

        let meta_address = self.natives.meta.allocate_record().await?;
        let define_address = self.natives.defines.allocate_record().await?;

        let mut entries = Vec::with_capacity(interface.fields.len());
        let mut mappings = Vec::with_capacity(interface.fields.len());
        for field in &interface.fields {
            let name_handle = self.strings.borrow(&field.name).await?;
            let mapping = if field.map_type.is_mapped() {
                self.indexes.create_table().await?
            } else {
                0
            };
            entries.push(DefineEntry {
                name_handle,
                field_type: field.field_type.code(),
                map_type: field.map_type.code(),
                array_length: field.array_length,
                mapping_address: mapping,
            });
            mappings.push(mapping);
        }
        MetaDefineRecord::new(&self.core, define_address)
            .write(&entries)
            .await?;
        MetaRecord::new(&self.core, meta_address)
            .write_new(&name, record_size, define_address, meta_address)
            .await?;

        let probe = NameProbe::new(&self.core, &name);
        self.registry()
            .set(hash_key(name.as_bytes()), &probe, meta_address)
            .await?;

        let field_count = interface.fields.len().to_string();
        self.cache_runtime(Arc::new(self.runtime_for(interface, meta_address, mappings)));
        log_event_with_fields(
            Event::InterfaceRegistered,
            &[
                ("type", name.as_str()),
                ("fields", field_count.as_str()),
                ("record_size", record_size.to_string().as_str()),
            ],
        );
        Ok(())
    }

    fn runtime_for(
        &self,
        interface: ObjectInterface,
        meta_address: u64,
        mappings: Vec<u64>,
    ) -> SchemaRuntime {
        let allocator = Arc::new(MetaAllocator::new(
            Arc::clone(&self.core),
            interface.full_name.clone(),
            meta_address,
            interface.record_size(),
            Some(Arc::clone(&self.natives.meta)),
        ));
        SchemaRuntime {
            layout: RecordLayout::compile(interface),
            allocator,
            meta_address,
            mappings,
        }
    }

    /// Rebuilds a user schema's runtime from its persisted definition.
    pub(super) async fn load_runtime(&self, name: &str) -> DbResult<Option<Arc<SchemaRuntime>>> {
        if is_native(name) {
            return Ok(None);
        }
        let probe = NameProbe::new(&self.core, name);
        let Some(meta_address) = self
            .registry()
            .get(hash_key(name.as_bytes()), &probe)
            .await?
        else {
            return Ok(None);
        };

        let header = MetaRecord::new(&self.core, meta_address)
            .read_header()
            .await?;
        let entries = MetaDefineRecord::new(&self.core, header.define_address)
            .read()
            .await?;

        let mut fields = Vec::with_capacity(entries.len());
        let mut mappings = Vec::with_capacity(entries.len());
        for entry in entries {
            let field_name = self.strings.read(entry.name_handle).await?;
            let field_type = FieldType::from_code(entry.field_type).ok_or_else(|| {
                SchemaError::malformed_definition(
                    name,
                    format!("field {} has type code {}", field_name, entry.field_type),
                )
            })?;
            let map_type = MapType::from_code(entry.map_type).ok_or_else(|| {
                SchemaError::malformed_definition(
                    name,
                    format!("field {} has map code {}", field_name, entry.map_type),
                )
            })?;
            fields.push(
                Field::new(field_name, field_type)
                    .array(entry.array_length)
                    .mapped(map_type),
            );
            mappings.push(entry.mapping_address);
        }

        let interface = ObjectInterface::new(name, fields);
        if interface.record_size() != header.record_size {
            return Err(SchemaError::malformed_definition(
                name,
                format!(
                    "stored record size {} differs from computed {}",
                    header.record_size,
                    interface.record_size()
                ),
            )
            .into());
        }
        Ok(Some(Arc::new(self.runtime_for(
            interface,
            meta_address,
            mappings,
        ))))
    }

    /// A registered schema's definition.
    pub async fn interface(&self, type_name: &str) -> DbResult<ObjectInterface> {
        Ok(self.runtime(type_name).await?.interface().clone())
    }

    /// Names of every user schema, sorted.
    pub async fn interfaces(&self) -> DbResult<Vec<String>> {
        let mut names = Vec::new();
        for (_, meta_address) in self.registry().entries().await? {
            let name = MetaRecord::new(&self.core, meta_address).read_name().await?;
            if !is_native(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Runtimes of every user schema.
    pub(super) async fn user_runtimes(&self) -> DbResult<Vec<Arc<SchemaRuntime>>> {
        let mut out = Vec::new();
        for name in self.interfaces().await? {
            out.push(self.runtime(&name).await?);
        }
        Ok(out)
    }
}
