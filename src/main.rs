//! objectdb CLI entry point
//!
//! Parses arguments, hands off to the CLI module, prints errors to stderr
//! and exits non-zero on failure.

use objectdb::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
