//! CLI-specific error types
//!
//! All CLI errors end the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::database::DbError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdin/stdout)
    IoError,
    /// Database file already exists
    AlreadyInitialized,
    /// Database file missing
    NotInitialized,
    /// Opening the database failed
    BootFailed,
    /// A database call failed
    DatabaseError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "OBJ_CLI_CONFIG_ERROR",
            Self::IoError => "OBJ_CLI_IO_ERROR",
            Self::AlreadyInitialized => "OBJ_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "OBJ_CLI_NOT_INITIALIZED",
            Self::BootFailed => "OBJ_CLI_BOOT_FAILED",
            Self::DatabaseError => "OBJ_CLI_DATABASE_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized(path: &std::path::Path) -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            format!("Database file {} already exists", path.display()),
        )
    }

    pub fn not_initialized(path: &std::path::Path) -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            format!(
                "Database file {} does not exist. Run 'objectdb init' first.",
                path.display()
            ),
        )
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// A failed database call, keeping the database's own code in the message.
    pub fn database(err: &DbError) -> Self {
        Self::new(
            CliErrorCode::DatabaseError,
            format!("{}: {}", err.code(), err),
        )
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
