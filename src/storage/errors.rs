//! Storage error types
//!
//! Error codes:
//! - OBJ_STORAGE_IO_ERROR (ERROR severity)
//! - OBJ_RECORD_NOT_FOUND (ERROR severity)
//! - OBJ_UNSUPPORTED_SIZE (ERROR severity)
//! - OBJ_ALLOCATION_INVARIANT (FATAL severity)
//! - OBJ_DATA_CORRUPTION (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, the database stays usable
    Error,
    /// The file or the allocator is in a state the engine cannot reason about
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Storage-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Disk I/O failure
    ObjStorageIoError,
    /// Address does not hold a live record
    ObjRecordNotFound,
    /// A value does not fit any fixed-size record class
    ObjUnsupportedSize,
    /// A block reported free capacity but allocation failed
    ObjAllocationInvariant,
    /// On-disk structure does not match what the engine wrote
    ObjDataCorruption,
}

impl StorageErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::ObjStorageIoError => "OBJ_STORAGE_IO_ERROR",
            StorageErrorCode::ObjRecordNotFound => "OBJ_RECORD_NOT_FOUND",
            StorageErrorCode::ObjUnsupportedSize => "OBJ_UNSUPPORTED_SIZE",
            StorageErrorCode::ObjAllocationInvariant => "OBJ_ALLOCATION_INVARIANT",
            StorageErrorCode::ObjDataCorruption => "OBJ_DATA_CORRUPTION",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::ObjStorageIoError => Severity::Error,
            StorageErrorCode::ObjRecordNotFound => Severity::Error,
            StorageErrorCode::ObjUnsupportedSize => Severity::Error,
            StorageErrorCode::ObjAllocationInvariant => Severity::Fatal,
            StorageErrorCode::ObjDataCorruption => Severity::Fatal,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Storage error type with full context
#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl StorageError {
    /// Create a new storage I/O error
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: StorageErrorCode::ObjStorageIoError,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    /// Create an I/O error that carries the offset it failed at
    pub fn io_at_offset(offset: u64, message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: StorageErrorCode::ObjStorageIoError,
            message: message.into(),
            details: Some(format!("address: {}", offset)),
            source: Some(source),
        }
    }

    /// Create a record-not-found error for an address
    pub fn record_not_found(address: u64) -> Self {
        Self {
            code: StorageErrorCode::ObjRecordNotFound,
            message: "No live record at address".into(),
            details: Some(format!("address: {}", address)),
            source: None,
        }
    }

    /// Create an unsupported size error
    pub fn unsupported_size(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::ObjUnsupportedSize,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create an allocation invariant violation (FATAL)
    pub fn allocation_invariant(block: u64, record_size: u32) -> Self {
        Self {
            code: StorageErrorCode::ObjAllocationInvariant,
            message: "Block reported free capacity but allocation failed".into(),
            details: Some(format!("block: {}, record_size: {}", block, record_size)),
            source: None,
        }
    }

    /// Create a data corruption error (FATAL)
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::ObjDataCorruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create a data corruption error with address context
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::ObjDataCorruption,
            message: reason.into(),
            details: Some(format!("address: {}", offset)),
            source: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Returns whether the error means "nothing lives there"
    pub fn is_not_found(&self) -> bool {
        self.code == StorageErrorCode::ObjRecordNotFound
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
