//! Document validation against an object interface
//!
//! Validation semantics:
//! - Every non-master field is present and non-null
//! - Each value matches the field's kind (number, string, bool, array)
//! - Integer kinds are range-checked
//! - Char buffers and arrays do not exceed the declared length
//! - Char buffers hold no NUL byte, which terminates them on disk
//! - A master value, when supplied, is a UUID
//!
//! Fields not declared by the interface are ignored. Every violation is
//! collected; validation never stops at the first one.

use serde_json::{Map, Value};

use super::errors::{SchemaError, SchemaResult, ValidationDetails};
use super::types::{Field, FieldType, MapType, ObjectInterface};
use super::value::{json_kind, FieldValue, Scalar};

/// Validates documents for one interface.
pub struct SchemaValidator<'a> {
    interface: &'a ObjectInterface,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(interface: &'a ObjectInterface) -> Self {
        Self { interface }
    }

    /// Validates `document`, reporting all violations together.
    pub fn validate_document(&self, document: &Value) -> SchemaResult<()> {
        let name = &self.interface.full_name;
        let Some(object) = document.as_object() else {
            return Err(SchemaError::validation_failed(
                name.clone(),
                vec![ValidationDetails::type_mismatch(
                    "$root",
                    "object",
                    json_kind(document),
                )],
            ));
        };

        let violations = self.collect_violations(object);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::validation_failed(name.clone(), violations))
        }
    }

    fn collect_violations(&self, object: &Map<String, Value>) -> Vec<ValidationDetails> {
        let mut violations = Vec::new();
        for field in &self.interface.fields {
            match object.get(&field.name) {
                None if field.map_type == MapType::Master => {}
                Some(Value::Null) if field.map_type == MapType::Master => {}
                None => violations.push(ValidationDetails::missing_field(&field.name)),
                Some(Value::Null) => violations.push(ValidationDetails::null_value(&field.name)),
                Some(value) => check_value(field, value, &mut violations),
            }
        }
        violations
    }
}

fn check_value(field: &Field, value: &Value, violations: &mut Vec<ValidationDetails>) {
    if field.field_type == FieldType::Char {
        match value.as_str() {
            None => violations.push(ValidationDetails::type_mismatch(
                &field.name,
                field.declared_type(),
                json_kind(value),
            )),
            Some(text) if text.len() > field.char_capacity() as usize => violations.push(
                ValidationDetails::too_long(&field.name, field.char_capacity(), text.len()),
            ),
            Some(text) if text.contains('\0') => violations.push(ValidationDetails::new(
                &field.name,
                "text without NUL bytes",
                "a NUL byte",
            )),
            Some(_) => {}
        }
        return;
    }

    if field.is_array() {
        let Some(items) = value.as_array() else {
            violations.push(ValidationDetails::type_mismatch(
                &field.name,
                field.declared_type(),
                json_kind(value),
            ));
            return;
        };
        if items.len() > field.array_length as usize {
            violations.push(ValidationDetails::too_long(
                &field.name,
                field.array_length,
                items.len(),
            ));
        }
        for (i, item) in items.iter().enumerate() {
            if let Err(expected) = Scalar::from_json(field.field_type, item) {
                violations.push(ValidationDetails::type_mismatch(
                    format!("{}[{}]", field.name, i),
                    expected,
                    json_kind(item),
                ));
            }
        }
        return;
    }

    if let Err(expected) = Scalar::from_json(field.field_type, value) {
        violations.push(ValidationDetails::type_mismatch(
            &field.name,
            expected,
            json_kind(value),
        ));
    }
}

/// Converts a validated document into per-field values, in field order.
///
/// Absent or null master values come back as `None`; every other field must
/// be present.
pub fn document_values(
    interface: &ObjectInterface,
    document: &Value,
) -> SchemaResult<Vec<Option<FieldValue<String>>>> {
    interface
        .fields
        .iter()
        .map(|field| match document.get(&field.name) {
            None | Some(Value::Null) if field.map_type == MapType::Master => Ok(None),
            None | Some(Value::Null) => Err(SchemaError::invalid_value(&field.name, "missing")),
            Some(value) => FieldValue::from_json(field, value).map(Some),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> ObjectInterface {
        ObjectInterface::new(
            "Person",
            vec![
                Field::new("Id", FieldType::Uuid).mapped(MapType::Master),
                Field::new("Name", FieldType::Char).array(8),
                Field::new("Age", FieldType::Int32),
                Field::new("Level", FieldType::Byte),
                Field::new("Tags", FieldType::String).array(2),
            ],
        )
    }

    #[test]
    fn test_valid_document_without_master() {
        let iface = person();
        let doc = json!({"Name": "Alice", "Age": 30, "Level": 3, "Tags": ["a"], "Extra": true});
        assert!(SchemaValidator::new(&iface).validate_document(&doc).is_ok());
    }

    #[test]
    fn test_all_violations_collected() {
        let iface = person();
        let doc = json!({"Name": "far too long", "Age": "thirty", "Level": 300, "Tags": ["a", 2, "c"]});
        let err = SchemaValidator::new(&iface).validate_document(&doc).unwrap_err();
        let fields: Vec<&str> = err.details().iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["Name", "Age", "Level", "Tags", "Tags[1]"]);
    }

    #[test]
    fn test_char_rejects_nul() {
        let iface = person();
        let doc = json!({"Name": "a\0b", "Age": 1, "Level": 0, "Tags": []});
        let err = SchemaValidator::new(&iface).validate_document(&doc).unwrap_err();
        assert_eq!(err.details()[0].field, "Name");
    }

    #[test]
    fn test_missing_and_null_fields() {
        let iface = person();
        let doc = json!({"Name": null, "Age": 1});
        let err = SchemaValidator::new(&iface).validate_document(&doc).unwrap_err();
        let fields: Vec<&str> = err.details().iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["Name", "Level", "Tags"]);
    }

    #[test]
    fn test_bad_master_rejected() {
        let iface = person();
        let doc = json!({"Id": "nope", "Name": "A", "Age": 1, "Level": 0, "Tags": []});
        assert!(SchemaValidator::new(&iface).validate_document(&doc).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let iface = person();
        let err = SchemaValidator::new(&iface)
            .validate_document(&json!([1, 2]))
            .unwrap_err();
        assert_eq!(err.details()[0].field, "$root");
    }

    #[test]
    fn test_document_values() {
        let iface = person();
        let doc = json!({"Name": "Al", "Age": 5, "Level": 1, "Tags": ["x"]});
        let values = document_values(&iface, &doc).unwrap();
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(FieldValue::Chars("Al".into())));
        assert_eq!(values[2], Some(FieldValue::Scalar(Scalar::Int32(5))));
    }
}
