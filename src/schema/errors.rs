//! Schema error types
//!
//! Error codes:
//! - OBJ_SCHEMA_VALIDATION_FAILED (REJECT)
//! - OBJ_INVALID_SCHEMA (REJECT)
//! - OBJ_UNSUPPORTED_TYPE (REJECT)
//! - OBJ_INVALID_VALUE (REJECT)
//! - OBJ_MALFORMED_DEFINITION (FATAL)

use std::fmt;

/// Severity levels for schema errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller request rejected
    Reject,
    /// Persisted schema metadata cannot be decoded
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Reject => write!(f, "REJECT"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorCode {
    /// Document violates the schema
    ObjSchemaValidationFailed,
    /// Schema definition is structurally invalid
    ObjInvalidSchema,
    /// Field type has no encoding for the requested use
    ObjUnsupportedType,
    /// A single value cannot be converted to a field's type
    ObjInvalidValue,
    /// Stored define-record holds codes this build does not know
    ObjMalformedDefinition,
}

impl SchemaErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            SchemaErrorCode::ObjSchemaValidationFailed => "OBJ_SCHEMA_VALIDATION_FAILED",
            SchemaErrorCode::ObjInvalidSchema => "OBJ_INVALID_SCHEMA",
            SchemaErrorCode::ObjUnsupportedType => "OBJ_UNSUPPORTED_TYPE",
            SchemaErrorCode::ObjInvalidValue => "OBJ_INVALID_VALUE",
            SchemaErrorCode::ObjMalformedDefinition => "OBJ_MALFORMED_DEFINITION",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SchemaErrorCode::ObjMalformedDefinition => Severity::Fatal,
            _ => Severity::Reject,
        }
    }
}

impl fmt::Display for SchemaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One validation violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationDetails {
    /// Field path (e.g. "Tags[2]")
    pub field: String,
    /// Expected type or condition
    pub expected: String,
    /// Actual value or type found
    pub actual: String,
}

impl ValidationDetails {
    pub fn new(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::new(field, "field to be present", "missing")
    }

    pub fn null_value(field: impl Into<String>) -> Self {
        Self::new(field, "non-null value", "null")
    }

    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::new(field, expected, actual)
    }

    pub fn too_long(field: impl Into<String>, limit: u32, actual: usize) -> Self {
        Self::new(field, format!("at most {}", limit), actual.to_string())
    }
}

impl fmt::Display for ValidationDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}': expected {}, got {}",
            self.field, self.expected, self.actual
        )
    }
}

/// Schema error type with full context
#[derive(Debug)]
pub struct SchemaError {
    code: SchemaErrorCode,
    message: String,
    type_name: Option<String>,
    details: Vec<ValidationDetails>,
}

impl SchemaError {
    fn new(code: SchemaErrorCode, message: String, type_name: Option<String>) -> Self {
        Self {
            code,
            message,
            type_name,
            details: Vec::new(),
        }
    }

    /// Every violation found in one document, reported together.
    pub fn validation_failed(type_name: impl Into<String>, details: Vec<ValidationDetails>) -> Self {
        let name = type_name.into();
        let joined = details
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            code: SchemaErrorCode::ObjSchemaValidationFailed,
            message: format!("Document validation failed for '{}': {}", name, joined),
            type_name: Some(name),
            details,
        }
    }

    pub fn invalid_schema(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let name = type_name.into();
        Self::new(
            SchemaErrorCode::ObjInvalidSchema,
            format!("Invalid schema '{}': {}", name, reason.into()),
            Some(name),
        )
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::new(SchemaErrorCode::ObjUnsupportedType, message.into(), None)
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            SchemaErrorCode::ObjInvalidValue,
            format!("Invalid value for field '{}': {}", field.into(), reason.into()),
            None,
        )
    }

    pub fn malformed_definition(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let name = type_name.into();
        Self::new(
            SchemaErrorCode::ObjMalformedDefinition,
            format!("Stored definition of '{}' is malformed: {}", name, reason.into()),
            Some(name),
        )
    }

    pub fn code(&self) -> SchemaErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn details(&self) -> &[ValidationDetails] {
        &self.details
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code.code(), self.message)
    }
}

impl std::error::Error for SchemaError {}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;
