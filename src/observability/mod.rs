//! Observability subsystem for objectdb
//!
//! - Structured logging (JSON lines on stderr)
//! - Typed lifecycle events
//! - Scoped begin/complete tracing for long operations
//!
//! Observability is read-only: a failed log write never fails the operation
//! that produced it.
//!
//! ```ignore
//! use objectdb::observability::{log_event_with_fields, Event, Logger};
//!
//! Logger::info("CUSTOM_EVENT", &[("rows", "42")]);
//! log_event_with_fields(Event::InterfaceRegistered, &[("type", "Person")]);
//! ```

mod events;
mod logger;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use scope::{ObservationScope, Timer};

/// Log a lifecycle event at its own severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::DatabaseOpened);
        log_event_with_fields(Event::InterfaceRegistered, &[("type", "Person")]);
    }
}
