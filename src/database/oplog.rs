//! Operation log
//!
//! One line per call, appended before the call executes:
//!
//! ```text
//! register interface <schema json>
//! insert <type> <document json>
//! update address <type> <address> <document json>
//! update master <type> <document json>
//! delete address <type> <address>
//! delete master <type> <uuid>
//! query master <type> <uuid>
//! query index <type> <field> <value json>
//! query address <type|*> <address>
//! ```
//!
//! A failed append fails the call before anything is changed.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::database::Database;
use super::errors::DbResult;
use crate::observability::{log_event_with_fields, Event};
use crate::storage::{StorageError, StorageResult};

pub struct OpLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl OpLog {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                StorageError::io_error(format!("failed to open log {}", path.display()), e)
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line.
    pub async fn append(&self, line: &str) -> StorageResult<()> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');

        let mut file = self.file.lock().await;
        let result = file.write_all(record.as_bytes()).await;
        if let Err(e) = result {
            let path = self.path.display().to_string();
            log_event_with_fields(
                Event::OplogAppendFailed,
                &[("path", path.as_str()), ("error", e.to_string().as_str())],
            );
            return Err(StorageError::io_error("failed to append to log", e));
        }
        Ok(())
    }

    pub async fn flush(&self) -> StorageResult<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| StorageError::io_error("failed to flush log", e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io_error("failed to sync log", e))
    }
}

/// Non-empty lines of a log file.
pub async fn read_lines(path: &Path) -> StorageResult<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        StorageError::io_error(format!("failed to read log {}", path.display()), e)
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

impl Database {
    /// Appends the line built by `line` when an operation log is configured.
    pub(super) async fn append_log(&self, line: impl FnOnce() -> String) -> DbResult<()> {
        if let Some(oplog) = &self.oplog {
            oplog.append(&line()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.log");
        let log = OpLog::open(&path).await.unwrap();
        log.append("insert Person {}").await.unwrap();
        log.append("delete address Person 42").await.unwrap();
        log.flush().await.unwrap();

        let lines = read_lines(&path).await.unwrap();
        assert_eq!(lines, vec!["insert Person {}", "delete address Person 42"]);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.log");
        {
            let log = OpLog::open(&path).await.unwrap();
            log.append("one").await.unwrap();
            log.flush().await.unwrap();
        }
        let log = OpLog::open(&path).await.unwrap();
        log.append("two").await.unwrap();
        log.flush().await.unwrap();
        assert_eq!(read_lines(&path).await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_missing_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(read_lines(&dir.path().join("absent.log")).await.is_err());
    }
}
