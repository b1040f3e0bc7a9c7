//! Typed field values
//!
//! A field value is generic over how reference strings are represented:
//! `FieldValue<String>` carries text (the document side), `FieldValue<u64>`
//! carries string-set handles (the record side). Conversion between the two
//! goes through [`FieldValue::try_map_strings`] once the caller has interned
//! or read the strings.

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::errors::{SchemaError, SchemaResult};
use super::types::{Field, FieldType};

const TICKS_PER_SECOND: i64 = 10_000_000;

/// One element of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar<S> {
    Byte(u8),
    Boolean(bool),
    Int32(i32),
    Float32(f32),
    Float64(f64),
    Int64(i64),
    String(S),
    Uuid(Uuid),
    Digest([u8; 16]),
    /// 100 ns ticks since 0001-01-01T00:00:00Z
    DateTime(i64),
}

/// The whole value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<S> {
    Scalar(Scalar<S>),
    /// Fixed-length char buffer, stored without its terminator
    Chars(String),
    Array(Vec<Scalar<S>>),
}

impl<S> Scalar<S> {
    pub fn try_map_strings<T, E>(self, f: &mut impl FnMut(S) -> Result<T, E>) -> Result<Scalar<T>, E> {
        Ok(match self {
            Scalar::Byte(v) => Scalar::Byte(v),
            Scalar::Boolean(v) => Scalar::Boolean(v),
            Scalar::Int32(v) => Scalar::Int32(v),
            Scalar::Float32(v) => Scalar::Float32(v),
            Scalar::Float64(v) => Scalar::Float64(v),
            Scalar::Int64(v) => Scalar::Int64(v),
            Scalar::String(s) => Scalar::String(f(s)?),
            Scalar::Uuid(v) => Scalar::Uuid(v),
            Scalar::Digest(v) => Scalar::Digest(v),
            Scalar::DateTime(v) => Scalar::DateTime(v),
        })
    }

    pub fn string(&self) -> Option<&S> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

impl<S> FieldValue<S> {
    /// Rebuilds the value with every reference string passed through `f`, in
    /// element order.
    pub fn try_map_strings<T, E>(
        self,
        f: &mut impl FnMut(S) -> Result<T, E>,
    ) -> Result<FieldValue<T>, E> {
        Ok(match self {
            FieldValue::Scalar(s) => FieldValue::Scalar(s.try_map_strings(f)?),
            FieldValue::Chars(c) => FieldValue::Chars(c),
            FieldValue::Array(items) => FieldValue::Array(
                items
                    .into_iter()
                    .map(|s| s.try_map_strings(f))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    /// Reference strings held by this value, in element order.
    pub fn strings(&self) -> Vec<&S> {
        match self {
            FieldValue::Scalar(s) => s.string().into_iter().collect(),
            FieldValue::Chars(_) => Vec::new(),
            FieldValue::Array(items) => items.iter().filter_map(Scalar::string).collect(),
        }
    }

    /// Elements as a slice; a scalar is a one-element slice, chars are none.
    pub fn elements(&self) -> &[Scalar<S>] {
        match self {
            FieldValue::Scalar(s) => std::slice::from_ref(s),
            FieldValue::Chars(_) => &[],
            FieldValue::Array(items) => items,
        }
    }
}

fn tick_base() -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(1, 1, 1)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Converts an RFC 3339 timestamp to ticks.
pub fn datetime_to_ticks(text: &str) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc);
    let delta = parsed.signed_duration_since(tick_base()?);
    let seconds = delta.num_seconds();
    let nanos = (delta - Duration::seconds(seconds)).num_nanoseconds()?;
    if seconds < 0 || nanos < 0 {
        return None;
    }
    seconds
        .checked_mul(TICKS_PER_SECOND)?
        .checked_add(nanos / 100)
}

/// Converts ticks back to an RFC 3339 timestamp in UTC.
pub fn ticks_to_datetime(ticks: i64) -> Option<String> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let rest = ticks.rem_euclid(TICKS_PER_SECOND) * 100;
    let at = tick_base()?
        .checked_add_signed(Duration::seconds(seconds))?
        .checked_add_signed(Duration::nanoseconds(rest))?;
    Some(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Lowercase hex of a digest.
pub fn digest_to_hex(bytes: &[u8; 16]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parses 32 hex characters.
pub fn digest_from_hex(text: &str) -> Option<[u8; 16]> {
    if text.len() != 32 || !text.is_ascii() {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// JSON kind name, for violation messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Scalar<String> {
    /// Converts one document element to a scalar of `field_type`.
    ///
    /// Returns a description of the expectation on mismatch.
    pub fn from_json(field_type: FieldType, value: &Value) -> Result<Self, String> {
        let expected = || format!("{}, got {}", field_type.type_name(), json_kind(value));
        let text = || value.as_str().ok_or_else(expected);
        Ok(match field_type {
            FieldType::Byte => {
                let v = value.as_u64().ok_or_else(expected)?;
                Scalar::Byte(u8::try_from(v).map_err(|_| format!("byte in 0..=255, got {}", v))?)
            }
            FieldType::Boolean => Scalar::Boolean(value.as_bool().ok_or_else(expected)?),
            FieldType::Int32 => {
                let v = value.as_i64().ok_or_else(expected)?;
                Scalar::Int32(i32::try_from(v).map_err(|_| format!("int32 in range, got {}", v))?)
            }
            FieldType::Int64 => Scalar::Int64(value.as_i64().ok_or_else(expected)?),
            FieldType::Float32 => Scalar::Float32(value.as_f64().ok_or_else(expected)? as f32),
            FieldType::Float64 => Scalar::Float64(value.as_f64().ok_or_else(expected)?),
            FieldType::String => Scalar::String(text()?.to_string()),
            FieldType::Uuid => {
                let s = text()?;
                Scalar::Uuid(Uuid::parse_str(s).map_err(|_| format!("uuid, got '{}'", s))?)
            }
            FieldType::Digest => {
                let s = text()?;
                Scalar::Digest(digest_from_hex(s).ok_or_else(|| format!("32 hex digits, got '{}'", s))?)
            }
            FieldType::DateTime => {
                let s = text()?;
                Scalar::DateTime(
                    datetime_to_ticks(s).ok_or_else(|| format!("RFC 3339 datetime, got '{}'", s))?,
                )
            }
            FieldType::Char => {
                return Err("char values are buffers, not scalars".to_string());
            }
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Byte(v) => Value::from(*v),
            Scalar::Boolean(v) => Value::from(*v),
            Scalar::Int32(v) => Value::from(*v),
            Scalar::Float32(v) => Value::from(*v as f64),
            Scalar::Float64(v) => Value::from(*v),
            Scalar::Int64(v) => Value::from(*v),
            Scalar::String(s) => Value::from(s.as_str()),
            Scalar::Uuid(u) => Value::from(u.hyphenated().to_string()),
            Scalar::Digest(d) => Value::from(digest_to_hex(d)),
            Scalar::DateTime(t) => ticks_to_datetime(*t).map(Value::from).unwrap_or(Value::Null),
        }
    }
}

impl FieldValue<String> {
    /// Converts a document value for `field`.
    pub fn from_json(field: &Field, value: &Value) -> SchemaResult<Self> {
        let invalid = |reason: String| SchemaError::invalid_value(&field.name, reason);
        if field.field_type == FieldType::Char {
            let text = value
                .as_str()
                .ok_or_else(|| invalid(format!("char buffer, got {}", json_kind(value))))?;
            if text.len() > field.char_capacity() as usize {
                return Err(invalid(format!(
                    "at most {} bytes, got {}",
                    field.char_capacity(),
                    text.len()
                )));
            }
            return Ok(FieldValue::Chars(text.to_string()));
        }
        if field.is_array() {
            let items = value
                .as_array()
                .ok_or_else(|| invalid(format!("array, got {}", json_kind(value))))?;
            if items.len() > field.array_length as usize {
                return Err(invalid(format!(
                    "at most {} elements, got {}",
                    field.array_length,
                    items.len()
                )));
            }
            return items
                .iter()
                .map(|item| Scalar::from_json(field.field_type, item).map_err(invalid))
                .collect::<SchemaResult<Vec<_>>>()
                .map(FieldValue::Array);
        }
        Scalar::from_json(field.field_type, value)
            .map(FieldValue::Scalar)
            .map_err(invalid)
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Scalar(s) => s.to_json(),
            FieldValue::Chars(c) => Value::from(c.as_str()),
            FieldValue::Array(items) => Value::Array(items.iter().map(Scalar::to_json).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datetime_ticks() {
        assert_eq!(datetime_to_ticks("0001-01-01T00:00:00Z"), Some(0));
        let ticks = datetime_to_ticks("2024-05-01T10:30:00Z").unwrap();
        assert_eq!(ticks_to_datetime(ticks).unwrap(), "2024-05-01T10:30:00Z");

        // Offsets normalize to UTC.
        let shifted = datetime_to_ticks("2024-05-01T12:30:00+02:00").unwrap();
        assert_eq!(shifted, ticks);

        let fractional = datetime_to_ticks("2024-05-01T10:30:00.1234567Z").unwrap();
        assert_eq!(fractional - ticks, 1_234_567);
        assert_eq!(datetime_to_ticks("yesterday"), None);
    }

    #[test]
    fn test_digest_hex() {
        let bytes = [0xABu8; 16];
        let hex = digest_to_hex(&bytes);
        assert_eq!(hex.len(), 32);
        assert_eq!(digest_from_hex(&hex), Some(bytes));
        assert_eq!(digest_from_hex("xyz"), None);
    }

    #[test]
    fn test_scalar_ranges() {
        assert!(Scalar::from_json(FieldType::Byte, &json!(255)).is_ok());
        assert!(Scalar::from_json(FieldType::Byte, &json!(256)).is_err());
        assert!(Scalar::from_json(FieldType::Byte, &json!(-1)).is_err());
        assert!(Scalar::from_json(FieldType::Int32, &json!(2_147_483_648i64)).is_err());
        assert!(Scalar::from_json(FieldType::Int64, &json!(1.5)).is_err());
        assert!(Scalar::from_json(FieldType::Float64, &json!(3)).is_ok());
    }

    #[test]
    fn test_field_value_forms() {
        let name = Field::new("Name", FieldType::Char).array(4);
        assert_eq!(
            FieldValue::from_json(&name, &json!("abcd")).unwrap(),
            FieldValue::Chars("abcd".into())
        );
        assert!(FieldValue::from_json(&name, &json!("abcde")).is_err());

        let tags = Field::new("Tags", FieldType::String).array(3);
        let value = FieldValue::from_json(&tags, &json!(["a", "b"])).unwrap();
        assert_eq!(value.strings(), vec!["a", "b"]);
        assert_eq!(value.to_json(), json!(["a", "b"]));
        assert!(FieldValue::from_json(&tags, &json!(["a", "b", "c", "d"])).is_err());
    }

    #[test]
    fn test_map_strings_preserves_order() {
        let value: FieldValue<String> = FieldValue::Array(vec![
            Scalar::String("x".into()),
            Scalar::String("y".into()),
        ]);
        let mut next = 10u64;
        let mapped = value
            .try_map_strings(&mut |_s| -> Result<u64, ()> {
                next += 1;
                Ok(next)
            })
            .unwrap();
        assert_eq!(
            mapped,
            FieldValue::Array(vec![Scalar::String(11), Scalar::String(12)])
        );
    }
}
