//! Schema subsystem for objectdb
//!
//! An object interface names a record type and lists its fields. Each field
//! has a fixed byte width, so every record of a type has the same size.
//!
//! # Pieces
//!
//! - [`ObjectInterface`], [`Field`], [`FieldType`], [`MapType`]: definitions
//! - [`SchemaValidator`]: document checks that collect every violation
//! - [`FieldValue`] / [`Scalar`]: typed values between documents and records
//! - [`RecordLayout`]: interface compiled into an offset table, with
//!   record encode/decode

mod errors;
mod layout;
mod types;
mod validator;
mod value;

pub use errors::{SchemaError, SchemaErrorCode, SchemaResult, Severity, ValidationDetails};
pub use layout::{char_bytes, scalar_bytes, FieldSlot, RecordLayout, StoredRecord};
pub use types::{Field, FieldType, MapType, ObjectInterface, MAX_FIELDS, MAX_NAME_LEN};
pub use validator::{document_values, SchemaValidator};
pub use value::{
    datetime_to_ticks, digest_from_hex, digest_to_hex, json_kind, ticks_to_datetime, FieldValue,
    Scalar,
};
