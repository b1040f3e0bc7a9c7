//! Scoped begin/complete logging for long-running operations
//!
//! - `{name}_BEGIN` on creation
//! - `{name}_COMPLETE` with `elapsed_ms` on [`ObservationScope::complete`]
//! - `{name}_FAILED` on [`ObservationScope::fail`]
//! - `{name}_INCOMPLETE` at WARN when dropped without either

use std::time::Instant;

use super::logger::Logger;

/// A scope that logs start and completion of one operation.
pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    timer: Timer,
    finished: bool,
}

impl ObservationScope {
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Scope whose fields are repeated on every line it logs.
    pub fn with_fields(name: &'static str, fields: &[(&'static str, &str)]) -> Self {
        let scope = Self {
            name,
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            timer: Timer::new(),
            finished: false,
        };
        Logger::info(&format!("{}_BEGIN", name), &scope.field_refs());
        scope
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    /// Logs `{name}_COMPLETE` with the scope fields plus `extra`.
    pub fn complete(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.timer.elapsed_ms();
        let mut fields = self.field_refs();
        fields.extend(extra.iter().copied());
        fields.push(("elapsed_ms", elapsed.as_str()));
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    /// Logs `{name}_FAILED` at ERROR.
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}

/// A simple duration timer for logging elapsed time
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed milliseconds as a string
    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_complete() {
        let scope = ObservationScope::with_fields("TEST", &[("key", "value")]);
        assert!(!scope.is_finished());
        scope.complete(&[("lines", "3")]);
    }

    #[test]
    fn test_scope_fail() {
        let scope = ObservationScope::new("TEST");
        scope.fail("something went wrong");
    }

    #[test]
    fn test_scope_drop_without_complete() {
        let scope = ObservationScope::new("TEST");
        drop(scope);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ms: u64 = timer.elapsed_ms().parse().unwrap();
        assert!(ms >= 10);
    }
}
