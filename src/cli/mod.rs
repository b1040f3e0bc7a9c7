//! CLI module for objectdb
//!
//! Provides command-line interface for:
//! - init: create and format a database file
//! - exec: run log-format commands from stdin
//! - replay: rebuild state from an operation log
//! - scan: dump one schema's records

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
