//! Line-oriented I/O for the CLI
//!
//! - Input: one log-format command per stdin line
//! - Output: one JSON object per stdout line
//! - UTF-8 only

use std::io::{self, BufRead, Write};

use serde_json::Value;

use super::errors::{CliError, CliResult};

/// Non-empty stdin lines, trimmed.
pub fn read_lines() -> impl Iterator<Item = CliResult<String>> {
    io::stdin()
        .lock()
        .lines()
        .map(|line| line.map(|l| l.trim().to_string()).map_err(CliError::from))
        .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_value(&serde_json::json!({
        "status": "ok",
        "data": data
    }))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_value(&serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}

fn write_value(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
