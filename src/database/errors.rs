//! Database errors
//!
//! Wraps the subsystem errors and adds the failures only the orchestrator
//! can detect. Every variant maps to a stable `OBJ_*` code.

use thiserror::Error;

use crate::config::ConfigError;
use crate::index::IndexError;
use crate::schema::SchemaError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("field '{field}' of '{type_name}' has no index for this lookup")]
    FieldNotFound { type_name: String, field: String },

    #[error("no interface owns address {0}")]
    AddressNotOwned(u64),

    #[error("interface '{0}' is already registered with a different definition")]
    InterfaceExists(String),

    #[error("invalid log line '{line}': {reason}")]
    InvalidLogLine { line: String, reason: String },
}

impl From<IndexError> for DbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Storage(e) => DbError::Storage(e),
            IndexError::Schema(e) => DbError::Schema(e),
        }
    }
}

impl DbError {
    /// Stable string code.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Storage(e) => e.code().code(),
            DbError::Schema(e) => e.code().code(),
            DbError::Config(_) => "OBJ_CONFIG_INVALID",
            DbError::UnknownInterface(_) => "OBJ_UNKNOWN_INTERFACE",
            DbError::RecordNotFound(_) => "OBJ_RECORD_NOT_FOUND",
            DbError::FieldNotFound { .. } => "OBJ_FIELD_NOT_FOUND",
            DbError::AddressNotOwned(_) => "OBJ_ADDRESS_NOT_OWNED",
            DbError::InterfaceExists(_) => "OBJ_INTERFACE_EXISTS",
            DbError::InvalidLogLine { .. } => "OBJ_INVALID_LOG_LINE",
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            DbError::RecordNotFound(_) => true,
            DbError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            DbError::Storage(e) => e.is_fatal(),
            DbError::Schema(e) => e.is_fatal(),
            _ => false,
        }
    }

    pub(crate) fn field_not_found(type_name: &str, field: &str) -> Self {
        DbError::FieldNotFound {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn invalid_line(line: &str, reason: impl Into<String>) -> Self {
        DbError::InvalidLogLine {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
