//! Index key encoding
//!
//! A key is the exact byte image the field occupies in a record: scalars use
//! their fixed-width encoding, char buffers are zero-padded to capacity and
//! reference strings are keyed by their 8-byte handle. Array fields contribute
//! one key per element.

use crate::schema::{char_bytes, scalar_bytes, Field, FieldType, FieldValue, SchemaError, SchemaResult};

/// Key widths of the `$kv.<width>` schemas, ascending.
pub const KV_WIDTHS: [u32; 7] = [4, 8, 16, 32, 64, 128, 256];

/// Index into [`KV_WIDTHS`] of the narrowest class holding `len` key bytes.
pub fn kv_class(len: usize) -> SchemaResult<usize> {
    KV_WIDTHS
        .iter()
        .position(|width| len <= *width as usize)
        .ok_or_else(|| {
            SchemaError::unsupported_type(format!(
                "index key of {} bytes is wider than {} bytes",
                len,
                KV_WIDTHS[KV_WIDTHS.len() - 1]
            ))
        })
}

/// Size of a `$kv.<width>` record: the padded key and a collection address.
pub fn kv_record_size(width: u32) -> u32 {
    width + 8
}

/// Keys a stored field value contributes to its index.
pub fn index_keys(field: &Field, value: &FieldValue<u64>) -> SchemaResult<Vec<Vec<u8>>> {
    match value {
        FieldValue::Array(items) if field.is_array() => {
            Ok(items.iter().map(scalar_bytes).collect())
        }
        FieldValue::Array(_) => Err(shape_error(field)),
        single => Ok(vec![lookup_key(field, single)?]),
    }
}

/// Key for looking up one value (an element, for array fields).
pub fn lookup_key(field: &Field, value: &FieldValue<u64>) -> SchemaResult<Vec<u8>> {
    match value {
        FieldValue::Scalar(scalar) if field.field_type != FieldType::Char => {
            Ok(scalar_bytes(scalar))
        }
        FieldValue::Chars(text) if field.field_type == FieldType::Char => {
            Ok(char_bytes(text, field.char_capacity()))
        }
        _ => Err(shape_error(field)),
    }
}

fn shape_error(field: &Field) -> SchemaError {
    SchemaError::invalid_value(
        &field.name,
        format!("value does not match declared type {}", field.declared_type()),
    )
}
