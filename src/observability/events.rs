//! Observable engine events
//!
//! Events are explicit and typed. Each carries the severity it is logged at.

use std::fmt;

use super::logger::Severity;

/// Observable events in objectdb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Existing database file opened
    DatabaseOpened,
    /// Fresh file formatted with native schemas
    DatabaseBootstrapped,
    /// Database closed and flushed
    DatabaseClosed,
    /// Configuration loaded
    ConfigLoaded,

    // Schemas
    /// User schema registered
    InterfaceRegistered,

    // Storage growth
    /// File grew by one block
    BlockAllocated,
    /// Meta-record chain extended
    MetaRecordChained,

    // Operation log
    /// Replay finished
    ReplayComplete,
    /// A log line could not be replayed
    ReplayLineFailed,
    /// Appending to the operation log failed
    OplogAppendFailed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::DatabaseOpened => "DATABASE_OPENED",
            Event::DatabaseBootstrapped => "DATABASE_BOOTSTRAPPED",
            Event::DatabaseClosed => "DATABASE_CLOSED",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::InterfaceRegistered => "INTERFACE_REGISTERED",
            Event::BlockAllocated => "BLOCK_ALLOCATED",
            Event::MetaRecordChained => "META_RECORD_CHAINED",
            Event::ReplayComplete => "REPLAY_COMPLETE",
            Event::ReplayLineFailed => "REPLAY_LINE_FAILED",
            Event::OplogAppendFailed => "OPLOG_APPEND_FAILED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::BlockAllocated => Severity::Trace,
            Event::ReplayLineFailed => Severity::Warn,
            Event::OplogAppendFailed => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
