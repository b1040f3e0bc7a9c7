//! CLI argument definitions using clap
//!
//! Commands:
//! - objectdb init --config <path>
//! - objectdb exec --config <path>
//! - objectdb replay --config <path> --log <path>
//! - objectdb scan --config <path> --type <name>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// objectdb - an embedded, schema-driven object store in one file
#[derive(Parser, Debug)]
#[command(name = "objectdb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and format a new database file
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./objectdb.json")]
        config: PathBuf,
    },

    /// Run log-format commands read line by line from stdin
    Exec {
        /// Path to configuration file
        #[arg(long, default_value = "./objectdb.json")]
        config: PathBuf,
    },

    /// Rebuild state by replaying an operation log
    Replay {
        /// Path to configuration file
        #[arg(long, default_value = "./objectdb.json")]
        config: PathBuf,

        /// Operation log to replay
        #[arg(long)]
        log: PathBuf,
    },

    /// Print every record of one schema
    Scan {
        /// Path to configuration file
        #[arg(long, default_value = "./objectdb.json")]
        config: PathBuf,

        /// Schema name
        #[arg(long = "type")]
        type_name: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replay() {
        let cli = Cli::try_parse_from(["objectdb", "replay", "--log", "ops.log"]).unwrap();
        match cli.command {
            Command::Replay { config, log } => {
                assert_eq!(config, PathBuf::from("./objectdb.json"));
                assert_eq!(log, PathBuf::from("ops.log"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_scan_requires_type() {
        assert!(Cli::try_parse_from(["objectdb", "scan"]).is_err());
        let cli = Cli::try_parse_from(["objectdb", "scan", "--type", "Person"]).unwrap();
        assert!(matches!(cli.command, Command::Scan { type_name, .. } if type_name == "Person"));
    }
}
