//! Object interface definitions
//!
//! Supported field types and their fixed widths:
//!
//! | type     | width | document form                  |
//! |----------|-------|--------------------------------|
//! | byte     | 1     | integer 0..=255                |
//! | boolean  | 1     | bool                           |
//! | char     | 1     | string (buffer of N bytes)     |
//! | int32    | 4     | integer                        |
//! | float32  | 4     | number                         |
//! | float64  | 8     | number                         |
//! | int64    | 8     | integer                        |
//! | string   | 8     | string (interned, 8-byte handle) |
//! | uuid     | 16    | hyphenated UUID string         |
//! | digest   | 16    | 32 hex characters              |
//! | datetime | 8     | RFC 3339 string                |

use serde::{Deserialize, Serialize};

use super::errors::{SchemaError, SchemaResult};
use crate::index::KV_WIDTHS;

pub const MAX_FIELDS: usize = 256;
pub const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Byte,
    Boolean,
    Char,
    Int32,
    Float32,
    Float64,
    Int64,
    String,
    Uuid,
    Digest,
    #[serde(rename = "datetime")]
    DateTime,
}

impl FieldType {
    /// Byte width of one element.
    pub fn width(&self) -> u32 {
        match self {
            FieldType::Byte | FieldType::Boolean | FieldType::Char => 1,
            FieldType::Int32 | FieldType::Float32 => 4,
            FieldType::Float64 | FieldType::Int64 | FieldType::String | FieldType::DateTime => 8,
            FieldType::Uuid | FieldType::Digest => 16,
        }
    }

    /// Code stored in define-records.
    pub fn code(&self) -> u8 {
        match self {
            FieldType::Byte => 1,
            FieldType::Boolean => 2,
            FieldType::Char => 3,
            FieldType::Int32 => 4,
            FieldType::Float32 => 5,
            FieldType::Float64 => 6,
            FieldType::Int64 => 7,
            FieldType::String => 8,
            FieldType::Uuid => 9,
            FieldType::Digest => 10,
            FieldType::DateTime => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => FieldType::Byte,
            2 => FieldType::Boolean,
            3 => FieldType::Char,
            4 => FieldType::Int32,
            5 => FieldType::Float32,
            6 => FieldType::Float64,
            7 => FieldType::Int64,
            8 => FieldType::String,
            9 => FieldType::Uuid,
            10 => FieldType::Digest,
            11 => FieldType::DateTime,
            _ => return None,
        })
    }

    /// Returns the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::Byte => "byte",
            FieldType::Boolean => "boolean",
            FieldType::Char => "char",
            FieldType::Int32 => "int32",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::Int64 => "int64",
            FieldType::String => "string",
            FieldType::Uuid => "uuid",
            FieldType::Digest => "digest",
            FieldType::DateTime => "datetime",
        }
    }
}

/// Index role of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    #[default]
    None,
    /// Unique primary key (scalar uuid)
    Master,
    /// Unique secondary key
    Index,
    /// Every element of an array field maps to the record
    IndexArray,
    /// Repeatable scalar key, large collection
    IndexHashSet,
    /// Repeatable scalar key, compact collection
    IndexSmallHashSet,
}

impl MapType {
    pub fn code(&self) -> u8 {
        match self {
            MapType::None => 0,
            MapType::Master => 1,
            MapType::Index => 2,
            MapType::IndexArray => 3,
            MapType::IndexHashSet => 4,
            MapType::IndexSmallHashSet => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MapType::None,
            1 => MapType::Master,
            2 => MapType::Index,
            3 => MapType::IndexArray,
            4 => MapType::IndexHashSet,
            5 => MapType::IndexSmallHashSet,
            _ => return None,
        })
    }

    /// Whether the field owns an index table.
    pub fn is_mapped(&self) -> bool {
        !matches!(self, MapType::None)
    }

    /// Master and Index: one record per key.
    pub fn is_unique(&self) -> bool {
        matches!(self, MapType::Master | MapType::Index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// 0 or 1 for scalars; buffer length for char
    #[serde(default)]
    pub array_length: u32,
    #[serde(default)]
    pub map_type: MapType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            array_length: 0,
            map_type: MapType::None,
        }
    }

    pub fn array(mut self, length: u32) -> Self {
        self.array_length = length;
        self
    }

    pub fn mapped(mut self, map_type: MapType) -> Self {
        self.map_type = map_type;
        self
    }

    /// Non-char field holding more than one element.
    pub fn is_array(&self) -> bool {
        self.field_type != FieldType::Char && self.array_length > 1
    }

    /// Byte capacity of a char field.
    pub fn char_capacity(&self) -> u32 {
        self.array_length.max(1)
    }

    /// Bytes this field occupies in a record, saturating at `u32::MAX`.
    pub fn byte_size(&self) -> u32 {
        self.checked_byte_size().unwrap_or(u32::MAX)
    }

    fn checked_byte_size(&self) -> Option<u32> {
        match self.field_type {
            FieldType::Char => Some(self.char_capacity()),
            t if self.is_array() => self.array_length.checked_mul(t.width())?.checked_add(4),
            t => Some(t.width()),
        }
    }

    /// Widest key one element of this field contributes to an index.
    pub fn key_width(&self) -> u32 {
        match self.field_type {
            FieldType::Char => self.char_capacity(),
            t => t.width(),
        }
    }

    /// Human-readable declared type, e.g. `char[32]` or `int32[4]`.
    pub fn declared_type(&self) -> String {
        if (self.field_type == FieldType::Char && self.array_length > 1) || self.is_array() {
            format!("{}[{}]", self.field_type.type_name(), self.array_length)
        } else {
            self.field_type.type_name().to_string()
        }
    }
}

/// A named, versionless record layout definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInterface {
    pub full_name: String,
    pub fields: Vec<Field>,
}

impl ObjectInterface {
    pub fn new(full_name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            full_name: full_name.into(),
            fields,
        }
    }

    /// Parses the JSON form used by `register interface`.
    pub fn from_json(json: &str) -> SchemaResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SchemaError::invalid_schema("<unparsed>", e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Sum of all field sizes, saturating at `u32::MAX`.
    pub fn record_size(&self) -> u32 {
        self.checked_record_size().unwrap_or(u32::MAX)
    }

    fn checked_record_size(&self) -> Option<u32> {
        self.fields
            .iter()
            .try_fold(0u32, |total, field| total.checked_add(field.checked_byte_size()?))
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn master_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.map_type == MapType::Master)
    }

    /// Checks the definition itself, before any document is involved.
    pub fn check_structure(&self) -> SchemaResult<()> {
        let name = &self.full_name;
        let invalid = |reason: String| SchemaError::invalid_schema(name.clone(), reason);

        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(invalid(format!("type name must be 1..={} bytes", MAX_NAME_LEN)));
        }
        if name.starts_with('$') {
            return Err(invalid("names starting with '$' are reserved".into()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid("type name must not contain whitespace".into()));
        }
        if self.fields.is_empty() {
            return Err(invalid("at least one field is required".into()));
        }
        if self.fields.len() > MAX_FIELDS {
            return Err(invalid(format!("more than {} fields", MAX_FIELDS)));
        }

        let mut seen = std::collections::HashSet::new();
        let mut masters = 0;
        for field in &self.fields {
            if field.name.is_empty() || field.name.len() > MAX_NAME_LEN {
                return Err(invalid(format!(
                    "field name '{}' must be 1..={} bytes",
                    field.name, MAX_NAME_LEN
                )));
            }
            if field.name.chars().any(char::is_whitespace) {
                return Err(invalid(format!(
                    "field name '{}' must not contain whitespace",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            match field.map_type {
                MapType::None => {}
                MapType::Master => {
                    masters += 1;
                    if field.field_type != FieldType::Uuid || field.array_length > 1 {
                        return Err(invalid(format!(
                            "master field '{}' must be a scalar uuid",
                            field.name
                        )));
                    }
                }
                MapType::IndexArray => {
                    if !field.is_array() {
                        return Err(invalid(format!(
                            "index_array field '{}' must be an array",
                            field.name
                        )));
                    }
                }
                MapType::Index | MapType::IndexHashSet | MapType::IndexSmallHashSet => {
                    if field.is_array() {
                        return Err(invalid(format!(
                            "index field '{}' must be scalar",
                            field.name
                        )));
                    }
                }
            }
            let widest = KV_WIDTHS[KV_WIDTHS.len() - 1];
            if field.map_type.is_mapped()
                && !field.map_type.is_unique()
                && field.key_width() > widest
            {
                return Err(SchemaError::unsupported_type(format!(
                    "{} key of field '{}' is {} bytes, wider than {} bytes",
                    field.declared_type(),
                    field.name,
                    field.key_width(),
                    widest
                )));
            }
        }
        if masters > 1 {
            return Err(invalid("at most one master field is allowed".into()));
        }
        if self.checked_record_size().is_none() {
            return Err(invalid("record size overflows 32 bits".into()));
        }
        Ok(())
    }
}
