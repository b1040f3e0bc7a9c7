//! Compiled record layout
//!
//! An [`ObjectInterface`] is compiled once into an ordered table of
//! `(field, offset, size)` entries. Encoding and decoding are straight loops
//! over that table.
//!
//! Per-field encoding (little-endian):
//!
//! - scalar: the element's fixed-width bytes
//! - char[N]: N bytes, UTF-8 text then zero fill
//! - array of N: `[u32 count][N x element]`, unused elements zeroed

use uuid::Uuid;

use super::errors::{SchemaError, SchemaResult};
use super::types::{Field, FieldType, ObjectInterface};
use super::value::{FieldValue, Scalar};
use crate::storage::to_array;

/// Location of one field inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub offset: u32,
    pub size: u32,
}

/// A stored record: one value per field, strings as handles.
pub type StoredRecord = Vec<FieldValue<u64>>;

#[derive(Debug, Clone)]
pub struct RecordLayout {
    interface: ObjectInterface,
    slots: Vec<FieldSlot>,
    record_size: u32,
}

impl RecordLayout {
    pub fn compile(interface: ObjectInterface) -> Self {
        let mut offset = 0;
        let slots = interface
            .fields
            .iter()
            .map(|field| {
                let slot = FieldSlot {
                    offset,
                    size: field.byte_size(),
                };
                offset += slot.size;
                slot
            })
            .collect();
        Self {
            interface,
            slots,
            record_size: offset,
        }
    }

    pub fn interface(&self) -> &ObjectInterface {
        &self.interface
    }

    pub fn name(&self) -> &str {
        &self.interface.full_name
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn fields(&self) -> impl Iterator<Item = (usize, &Field, FieldSlot)> {
        self.interface
            .fields
            .iter()
            .zip(self.slots.iter().copied())
            .enumerate()
            .map(|(i, (f, s))| (i, f, s))
    }

    pub fn slot(&self, index: usize) -> FieldSlot {
        self.slots[index]
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.interface.fields[index]
    }

    /// Encodes a full record.
    pub fn encode(&self, values: &[FieldValue<u64>]) -> SchemaResult<Vec<u8>> {
        if values.len() != self.slots.len() {
            return Err(SchemaError::invalid_schema(
                self.name(),
                format!("expected {} values, got {}", self.slots.len(), values.len()),
            ));
        }
        let mut buf = vec![0u8; self.record_size as usize];
        for ((_, field, slot), value) in self.fields().zip(values) {
            let start = slot.offset as usize;
            let out = &mut buf[start..start + slot.size as usize];
            encode_field(field, value, out)
                .map_err(|reason| SchemaError::invalid_value(&field.name, reason))?;
        }
        Ok(buf)
    }

    /// Decodes a full record.
    pub fn decode(&self, bytes: &[u8]) -> SchemaResult<StoredRecord> {
        if bytes.len() < self.record_size as usize {
            return Err(SchemaError::invalid_schema(
                self.name(),
                format!("record is {} bytes, expected {}", bytes.len(), self.record_size),
            ));
        }
        self.fields()
            .map(|(_, field, slot)| decode_field(field, self.field_bytes(bytes, slot)))
            .collect()
    }

    /// Decodes one field from a full record.
    pub fn decode_at(&self, index: usize, record: &[u8]) -> SchemaResult<FieldValue<u64>> {
        decode_field(self.field(index), self.field_bytes(record, self.slot(index)))
    }

    fn field_bytes<'b>(&self, record: &'b [u8], slot: FieldSlot) -> &'b [u8] {
        &record[slot.offset as usize..(slot.offset + slot.size) as usize]
    }
}

fn encode_scalar(field_type: FieldType, value: &Scalar<u64>, out: &mut [u8]) -> Result<(), String> {
    match (field_type, value) {
        (FieldType::Byte, Scalar::Byte(v)) => out[0] = *v,
        (FieldType::Boolean, Scalar::Boolean(v)) => out[0] = u8::from(*v),
        (FieldType::Int32, Scalar::Int32(v)) => out.copy_from_slice(&v.to_le_bytes()),
        (FieldType::Float32, Scalar::Float32(v)) => out.copy_from_slice(&v.to_le_bytes()),
        (FieldType::Float64, Scalar::Float64(v)) => out.copy_from_slice(&v.to_le_bytes()),
        (FieldType::Int64, Scalar::Int64(v)) => out.copy_from_slice(&v.to_le_bytes()),
        (FieldType::String, Scalar::String(h)) => out.copy_from_slice(&h.to_le_bytes()),
        (FieldType::Uuid, Scalar::Uuid(u)) => out.copy_from_slice(u.as_bytes()),
        (FieldType::Digest, Scalar::Digest(d)) => out.copy_from_slice(d),
        (FieldType::DateTime, Scalar::DateTime(t)) => out.copy_from_slice(&t.to_le_bytes()),
        (t, v) => return Err(format!("{} field cannot hold {:?}", t.type_name(), v)),
    }
    Ok(())
}

/// Raw key bytes of one element, as stored in a record.
pub fn scalar_bytes(value: &Scalar<u64>) -> Vec<u8> {
    match value {
        Scalar::Byte(v) => vec![*v],
        Scalar::Boolean(v) => vec![u8::from(*v)],
        Scalar::Int32(v) => v.to_le_bytes().to_vec(),
        Scalar::Float32(v) => v.to_le_bytes().to_vec(),
        Scalar::Float64(v) => v.to_le_bytes().to_vec(),
        Scalar::Int64(v) => v.to_le_bytes().to_vec(),
        Scalar::String(h) => h.to_le_bytes().to_vec(),
        Scalar::Uuid(u) => u.as_bytes().to_vec(),
        Scalar::Digest(d) => d.to_vec(),
        Scalar::DateTime(t) => t.to_le_bytes().to_vec(),
    }
}

/// Zero-padded char buffer of `capacity` bytes.
pub fn char_bytes(text: &str, capacity: u32) -> Vec<u8> {
    let mut buf = vec![0u8; capacity as usize];
    let len = text.len().min(buf.len());
    buf[..len].copy_from_slice(&text.as_bytes()[..len]);
    buf
}

fn encode_field(field: &Field, value: &FieldValue<u64>, out: &mut [u8]) -> Result<(), String> {
    let width = field.field_type.width() as usize;
    match value {
        FieldValue::Chars(text) if field.field_type == FieldType::Char => {
            if text.len() > out.len() {
                return Err(format!("{} bytes exceed capacity {}", text.len(), out.len()));
            }
            out[..text.len()].copy_from_slice(text.as_bytes());
            Ok(())
        }
        FieldValue::Array(items) if field.is_array() => {
            if items.len() > field.array_length as usize {
                return Err(format!(
                    "{} elements exceed length {}",
                    items.len(),
                    field.array_length
                ));
            }
            out[0..4].copy_from_slice(&(items.len() as u32).to_le_bytes());
            for (i, item) in items.iter().enumerate() {
                let start = 4 + i * width;
                encode_scalar(field.field_type, item, &mut out[start..start + width])?;
            }
            Ok(())
        }
        FieldValue::Scalar(scalar) if !field.is_array() && field.field_type != FieldType::Char => {
            encode_scalar(field.field_type, scalar, out)
        }
        _ => Err(format!("value shape does not match {}", field.declared_type())),
    }
}

fn decode_scalar(field_type: FieldType, bytes: &[u8]) -> SchemaResult<Scalar<u64>> {
    Ok(match field_type {
        FieldType::Byte => Scalar::Byte(bytes[0]),
        FieldType::Boolean => Scalar::Boolean(bytes[0] != 0),
        FieldType::Int32 => Scalar::Int32(i32::from_le_bytes(to_array(bytes))),
        FieldType::Float32 => Scalar::Float32(f32::from_le_bytes(to_array(bytes))),
        FieldType::Float64 => Scalar::Float64(f64::from_le_bytes(to_array(bytes))),
        FieldType::Int64 => Scalar::Int64(i64::from_le_bytes(to_array(bytes))),
        FieldType::String => Scalar::String(u64::from_le_bytes(to_array(bytes))),
        FieldType::Uuid => Scalar::Uuid(Uuid::from_bytes(to_array(bytes))),
        FieldType::Digest => Scalar::Digest(to_array(bytes)),
        FieldType::DateTime => Scalar::DateTime(i64::from_le_bytes(to_array(bytes))),
        FieldType::Char => {
            return Err(SchemaError::unsupported_type("char has no scalar encoding"));
        }
    })
}

fn decode_field(field: &Field, bytes: &[u8]) -> SchemaResult<FieldValue<u64>> {
    if field.field_type == FieldType::Char {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        return Ok(FieldValue::Chars(
            String::from_utf8_lossy(&bytes[..end]).into_owned(),
        ));
    }
    let width = field.field_type.width() as usize;
    if field.is_array() {
        let count = u32::from_le_bytes(to_array(&bytes[0..4])).min(field.array_length) as usize;
        let items = (0..count)
            .map(|i| decode_scalar(field.field_type, &bytes[4 + i * width..4 + (i + 1) * width]))
            .collect::<SchemaResult<Vec<_>>>()?;
        return Ok(FieldValue::Array(items));
    }
    decode_scalar(field.field_type, &bytes[..width]).map(FieldValue::Scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::MapType;

    fn sample() -> RecordLayout {
        RecordLayout::compile(ObjectInterface::new(
            "Sample",
            vec![
                Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
                Field::new("Name", FieldType::Char).array(8),
                Field::new("Flag", FieldType::Boolean),
                Field::new("Scores", FieldType::Int32).array(3),
                Field::new("Note", FieldType::String),
            ],
        ))
    }

    #[test]
    fn test_offsets() {
        let layout = sample();
        let offsets: Vec<u32> = layout.fields().map(|(_, _, s)| s.offset).collect();
        assert_eq!(offsets, vec![0, 16, 24, 25, 41]);
        assert_eq!(layout.record_size(), 49);
    }

    #[test]
    fn test_encode_layout_bytes() {
        let layout = sample();
        let id = Uuid::from_u128(0x0102);
        let values = vec![
            FieldValue::Scalar(Scalar::Uuid(id)),
            FieldValue::Chars("Bob".into()),
            FieldValue::Scalar(Scalar::Boolean(true)),
            FieldValue::Array(vec![Scalar::Int32(7), Scalar::Int32(-1)]),
            FieldValue::Scalar(Scalar::String(4096)),
        ];
        let bytes = layout.encode(&values).unwrap();

        assert_eq!(&bytes[0..16], id.as_bytes());
        assert_eq!(&bytes[16..24], b"Bob\0\0\0\0\0");
        assert_eq!(bytes[24], 1);
        assert_eq!(&bytes[25..29], &2u32.to_le_bytes());
        assert_eq!(&bytes[29..33], &7i32.to_le_bytes());
        assert_eq!(&bytes[33..37], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[37..41], &[0, 0, 0, 0]);
        assert_eq!(&bytes[41..49], &4096u64.to_le_bytes());

        assert_eq!(layout.decode(&bytes).unwrap(), values);
        assert_eq!(
            layout.decode_at(1, &bytes).unwrap(),
            FieldValue::Chars("Bob".into())
        );
    }

    #[test]
    fn test_full_char_buffer_has_no_terminator() {
        let layout = sample();
        let mut values = vec![
            FieldValue::Scalar(Scalar::Uuid(Uuid::nil())),
            FieldValue::Chars("12345678".into()),
            FieldValue::Scalar(Scalar::Boolean(false)),
            FieldValue::Array(vec![]),
            FieldValue::Scalar(Scalar::String(0)),
        ];
        let bytes = layout.encode(&values).unwrap();
        assert_eq!(layout.decode(&bytes).unwrap(), values);

        values[1] = FieldValue::Chars("123456789".into());
        assert!(layout.encode(&values).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let layout = sample();
        let values = vec![
            FieldValue::Scalar(Scalar::Int32(1)),
            FieldValue::Chars("x".into()),
            FieldValue::Scalar(Scalar::Boolean(false)),
            FieldValue::Array(vec![]),
            FieldValue::Scalar(Scalar::String(0)),
        ];
        assert!(layout.encode(&values).is_err());
    }
}
