//! CLI command implementations
//!
//! Every command loads the configuration, opens the database on a tokio
//! runtime, does its work and closes the database before returning.

use std::path::Path;

use serde_json::{json, Value};

use crate::config::StoreConfig;
use crate::database::{Database, LogCommand};
use crate::observability::{log_event_with_fields, Event};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_lines, write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;
    runtime.block_on(async {
        match cmd {
            Command::Init { config } => init(&config).await,
            Command::Exec { config } => exec(&config).await,
            Command::Replay { config, log } => replay(&config, &log).await,
            Command::Scan { config, type_name } => scan(&config, &type_name).await,
        }
    })
}

fn load_config(path: &Path) -> CliResult<StoreConfig> {
    let config = StoreConfig::load(path)?;
    let path = path.display().to_string();
    let data_file = config.data_file.display().to_string();
    log_event_with_fields(
        Event::ConfigLoaded,
        &[("path", path.as_str()), ("data_file", data_file.as_str())],
    );
    Ok(config)
}

async fn open(config: StoreConfig) -> CliResult<Database> {
    Database::open(config)
        .await
        .map_err(|e| CliError::boot_failed(format!("{}: {}", e.code(), e)))
}

/// Opens an existing database file.
async fn open_existing(config_path: &Path) -> CliResult<Database> {
    let config = load_config(config_path)?;
    if !config.data_file.exists() {
        return Err(CliError::not_initialized(&config.data_file));
    }
    open(config).await
}

/// Creates and formats a new database file.
pub async fn init(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    if config.data_file.exists() {
        return Err(CliError::already_initialized(&config.data_file));
    }
    if let Some(parent) = config.data_file.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CliError::config_error(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
    }

    let data_file = config.data_file.display().to_string();
    let db = open(config).await?;
    let boundary = db.boundary().await;
    db.close().await.map_err(|e| CliError::database(&e))?;
    write_response(json!({
        "initialized": true,
        "data_file": data_file,
        "size": boundary,
    }))
}

/// Runs one log-format command per stdin line and answers each with one
/// JSON line. A failed command is reported and the loop goes on.
pub async fn exec(config_path: &Path) -> CliResult<()> {
    let db = open_existing(config_path).await?;
    for line in read_lines() {
        let line = line?;
        let outcome = match LogCommand::parse(&line) {
            Ok(command) => db.execute(command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => write_response(value)?,
            Err(e) => write_error(e.code(), &e.to_string())?,
        }
    }
    db.close().await.map_err(|e| CliError::database(&e))
}

/// Replays an operation log into the configured database.
pub async fn replay(config_path: &Path, log: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    if config.oplog_file.as_deref() == Some(log) {
        return Err(CliError::config_error(
            "the replayed log cannot be the database's own operation log",
        ));
    }
    let db = open(config).await?;
    let stats = db
        .replay_log(log)
        .await
        .map_err(|e| CliError::database(&e))?;
    db.close().await.map_err(|e| CliError::database(&e))?;
    write_response(json!({
        "applied": stats.applied,
        "failed": stats.failed,
    }))
}

/// Prints every record of a schema as `{"address": .., "record": ..}`.
pub async fn scan(config_path: &Path, type_name: &str) -> CliResult<()> {
    let db = open_existing(config_path).await?;
    let rows = db
        .scan(type_name)
        .await
        .map_err(|e| CliError::database(&e))?;
    let rows: Vec<Value> = rows
        .into_iter()
        .map(|(address, record)| json!({"address": address, "record": record}))
        .collect();
    write_response(Value::from(rows))
}
