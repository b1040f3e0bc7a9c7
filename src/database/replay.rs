//! Operation log parsing and replay
//!
//! A log line is a few whitespace-separated command words followed, for
//! commands that carry one, by a JSON tail that runs to the end of the line.
//! Replaying a line runs the same operation as the original call without
//! appending to the log again.

use std::fmt;
use std::path::Path;

use serde_json::Value;
use uuid::Uuid;

use super::database::Database;
use super::errors::{DbError, DbResult};
use super::oplog::read_lines;
use crate::observability::{log_event_with_fields, Event, ObservationScope};
use crate::schema::{MapType, ObjectInterface};

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogCommand {
    RegisterInterface(ObjectInterface),
    Insert {
        type_name: String,
        document: Value,
    },
    UpdateAddress {
        type_name: String,
        address: u64,
        document: Value,
    },
    UpdateMaster {
        type_name: String,
        document: Value,
    },
    DeleteAddress {
        type_name: String,
        address: u64,
    },
    DeleteMaster {
        type_name: String,
        master: Uuid,
    },
    QueryMaster {
        type_name: String,
        master: Uuid,
    },
    QueryIndex {
        type_name: String,
        field: String,
        value: Value,
    },
    /// `None` when the schema is unknown to the caller (`*`)
    QueryAddress {
        type_name: Option<String>,
        address: u64,
    },
}

/// Splits off up to `count` leading words; returns them and the trimmed rest.
fn split_words(line: &str, count: usize) -> (Vec<&str>, &str) {
    let mut rest = line.trim_start();
    let mut words = Vec::with_capacity(count);
    while words.len() < count && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        words.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (words, rest.trim_end())
}

impl LogCommand {
    pub fn parse(line: &str) -> DbResult<Self> {
        let invalid = |reason: &str| DbError::invalid_line(line, reason);
        let json = |tail: &str| -> DbResult<Value> {
            if tail.is_empty() {
                return Err(invalid("missing JSON tail"));
            }
            serde_json::from_str(tail).map_err(|e| DbError::invalid_line(line, e.to_string()))
        };
        let address = |word: &str| -> DbResult<u64> {
            word.parse()
                .map_err(|_| DbError::invalid_line(line, format!("bad address '{}'", word)))
        };
        let uuid = |word: &str| -> DbResult<Uuid> {
            Uuid::parse_str(word)
                .map_err(|_| DbError::invalid_line(line, format!("bad uuid '{}'", word)))
        };
        let no_tail = |tail: &str| -> DbResult<()> {
            if tail.is_empty() {
                Ok(())
            } else {
                Err(invalid("unexpected trailing text"))
            }
        };

        let (head, _) = split_words(line, 2);
        match head.as_slice() {
            ["register", "interface"] => {
                let (_, tail) = split_words(line, 2);
                if tail.is_empty() {
                    return Err(invalid("missing JSON tail"));
                }
                let interface = ObjectInterface::from_json(tail)?;
                Ok(LogCommand::RegisterInterface(interface))
            }
            ["insert", _] => {
                let (words, tail) = split_words(line, 2);
                Ok(LogCommand::Insert {
                    type_name: words[1].to_string(),
                    document: json(tail)?,
                })
            }
            ["update", "address"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => Ok(LogCommand::UpdateAddress {
                    type_name: words[2].to_string(),
                    address: address(words[3])?,
                    document: json(tail)?,
                }),
                _ => Err(invalid("expected 'update address <type> <address> <json>'")),
            },
            ["update", "master"] => match split_words(line, 3) {
                (words, tail) if words.len() == 3 => Ok(LogCommand::UpdateMaster {
                    type_name: words[2].to_string(),
                    document: json(tail)?,
                }),
                _ => Err(invalid("expected 'update master <type> <json>'")),
            },
            ["delete", "address"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => {
                    no_tail(tail)?;
                    Ok(LogCommand::DeleteAddress {
                        type_name: words[2].to_string(),
                        address: address(words[3])?,
                    })
                }
                _ => Err(invalid("expected 'delete address <type> <address>'")),
            },
            ["delete", "master"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => {
                    no_tail(tail)?;
                    Ok(LogCommand::DeleteMaster {
                        type_name: words[2].to_string(),
                        master: uuid(words[3])?,
                    })
                }
                _ => Err(invalid("expected 'delete master <type> <uuid>'")),
            },
            ["query", "master"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => {
                    no_tail(tail)?;
                    Ok(LogCommand::QueryMaster {
                        type_name: words[2].to_string(),
                        master: uuid(words[3])?,
                    })
                }
                _ => Err(invalid("expected 'query master <type> <uuid>'")),
            },
            ["query", "index"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => Ok(LogCommand::QueryIndex {
                    type_name: words[2].to_string(),
                    field: words[3].to_string(),
                    value: json(tail)?,
                }),
                _ => Err(invalid("expected 'query index <type> <field> <json>'")),
            },
            ["query", "address"] => match split_words(line, 4) {
                (words, tail) if words.len() == 4 => {
                    no_tail(tail)?;
                    Ok(LogCommand::QueryAddress {
                        type_name: (words[2] != "*").then(|| words[2].to_string()),
                        address: address(words[3])?,
                    })
                }
                _ => Err(invalid("expected 'query address <type|*> <address>'")),
            },
            _ => Err(invalid("unknown command")),
        }
    }

    /// Whether the command changes state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            LogCommand::QueryMaster { .. }
                | LogCommand::QueryIndex { .. }
                | LogCommand::QueryAddress { .. }
        )
    }
}

impl fmt::Display for LogCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCommand::RegisterInterface(interface) => {
                write!(f, "register interface {}", interface.to_json())
            }
            LogCommand::Insert { type_name, document } => {
                write!(f, "insert {} {}", type_name, document)
            }
            LogCommand::UpdateAddress {
                type_name,
                address,
                document,
            } => write!(f, "update address {} {} {}", type_name, address, document),
            LogCommand::UpdateMaster { type_name, document } => {
                write!(f, "update master {} {}", type_name, document)
            }
            LogCommand::DeleteAddress { type_name, address } => {
                write!(f, "delete address {} {}", type_name, address)
            }
            LogCommand::DeleteMaster { type_name, master } => {
                write!(f, "delete master {} {}", type_name, master.hyphenated())
            }
            LogCommand::QueryMaster { type_name, master } => {
                write!(f, "query master {} {}", type_name, master.hyphenated())
            }
            LogCommand::QueryIndex {
                type_name,
                field,
                value,
            } => write!(f, "query index {} {} {}", type_name, field, value),
            LogCommand::QueryAddress { type_name, address } => write!(
                f,
                "query address {} {}",
                type_name.as_deref().unwrap_or("*"),
                address
            ),
        }
    }
}

/// Outcome of replaying a log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub failed: usize,
}

impl Database {
    /// Runs `command` as a regular call, logging it when a log is configured.
    pub async fn execute(&self, command: LogCommand) -> DbResult<Value> {
        match command {
            LogCommand::RegisterInterface(interface) => {
                self.register_interface(interface).await?;
                Ok(Value::Bool(true))
            }
            LogCommand::Insert { type_name, document } => {
                Ok(self.insert(&type_name, &document).await?.to_json())
            }
            LogCommand::UpdateAddress {
                type_name,
                address,
                document,
            } => Ok(self.update(&type_name, address, &document).await?.into()),
            LogCommand::UpdateMaster { type_name, document } => {
                Ok(self.update_by_master(&type_name, &document).await?.into())
            }
            LogCommand::DeleteAddress { type_name, address } => {
                Ok(self.delete(&type_name, address).await?.into())
            }
            LogCommand::DeleteMaster { type_name, master } => {
                Ok(self.delete_by_master(&type_name, master).await?.into())
            }
            LogCommand::QueryMaster { type_name, master } => {
                self.find_by_master(&type_name, master).await
            }
            LogCommand::QueryIndex {
                type_name,
                field,
                value,
            } => {
                self.append_log(|| format!("query index {} {} {}", type_name, field, value))
                    .await?;
                self.query_index(&type_name, &field, &value).await
            }
            LogCommand::QueryAddress {
                type_name: Some(type_name),
                address,
            } => self.find_by_address(&type_name, address).await,
            LogCommand::QueryAddress {
                type_name: None,
                address,
            } => self.find_by_address_any(address).await,
        }
    }

    /// Replays one log line without logging it again. Queries that find
    /// nothing yield `null` instead of an error.
    pub async fn restore_by_logger(&self, line: &str) -> DbResult<Value> {
        let command = LogCommand::parse(line)?;
        let is_query = !command.is_mutation();
        let result = self.apply(command).await;
        match result {
            Err(e) if is_query && e.is_not_found() => Ok(Value::Null),
            other => other,
        }
    }

    async fn apply(&self, command: LogCommand) -> DbResult<Value> {
        match command {
            LogCommand::RegisterInterface(interface) => {
                self.apply_register(interface).await?;
                Ok(Value::Bool(true))
            }
            LogCommand::Insert { type_name, document } => {
                Ok(self.apply_insert(&type_name, &document).await?.to_json())
            }
            LogCommand::UpdateAddress {
                type_name,
                address,
                document,
            } => Ok(self.apply_update(&type_name, address, &document).await?.into()),
            LogCommand::UpdateMaster { type_name, document } => Ok(self
                .apply_update_by_master(&type_name, &document)
                .await?
                .into()),
            LogCommand::DeleteAddress { type_name, address } => {
                Ok(self.apply_delete(&type_name, address).await?.into())
            }
            LogCommand::DeleteMaster { type_name, master } => {
                Ok(self.apply_delete_by_master(&type_name, master).await?.into())
            }
            LogCommand::QueryMaster { type_name, master } => {
                self.apply_find_by_master(&type_name, master).await
            }
            LogCommand::QueryIndex {
                type_name,
                field,
                value,
            } => self.query_index(&type_name, &field, &value).await,
            LogCommand::QueryAddress {
                type_name: Some(type_name),
                address,
            } => self.apply_find_by_address(&type_name, address).await,
            LogCommand::QueryAddress {
                type_name: None,
                address,
            } => self.apply_find_by_address_any(address).await,
        }
    }

    /// `query index` dispatches on the field's role: unique roles yield the
    /// document, collection roles the array of addresses.
    async fn query_index(&self, type_name: &str, field: &str, value: &Value) -> DbResult<Value> {
        let runtime = self.runtime(type_name).await?;
        let role = runtime
            .interface()
            .field(field)
            .map(|f| f.map_type)
            .unwrap_or_default();
        match role {
            MapType::None => Err(DbError::field_not_found(type_name, field)),
            MapType::Master | MapType::Index => {
                self.apply_find_by_index(type_name, field, value).await
            }
            collection => {
                let addresses = self
                    .collection_addresses(type_name, field, value, &[collection])
                    .await?;
                Ok(Value::from(addresses))
            }
        }
    }

    /// Replays every line of the log at `path`.
    ///
    /// Lines that fail are logged and counted; a fatal error stops the
    /// replay.
    pub async fn replay_log(&self, path: &Path) -> DbResult<ReplayStats> {
        let path_text = path.display().to_string();
        let scope = ObservationScope::with_fields("REPLAY", &[("path", path_text.as_str())]);
        let lines = match read_lines(path).await {
            Ok(lines) => lines,
            Err(e) => {
                scope.fail(&e.to_string());
                return Err(e.into());
            }
        };

        let mut stats = ReplayStats::default();
        for (number, line) in lines.iter().enumerate() {
            match self.restore_by_logger(line).await {
                Ok(_) => stats.applied += 1,
                Err(e) => {
                    stats.failed += 1;
                    let number = (number + 1).to_string();
                    log_event_with_fields(
                        Event::ReplayLineFailed,
                        &[
                            ("line", number.as_str()),
                            ("code", e.code()),
                            ("error", e.to_string().as_str()),
                        ],
                    );
                    if e.is_fatal() {
                        scope.fail(&e.to_string());
                        return Err(e);
                    }
                }
            }
        }

        let applied = stats.applied.to_string();
        let failed = stats.failed.to_string();
        log_event_with_fields(
            Event::ReplayComplete,
            &[("applied", applied.as_str()), ("failed", failed.as_str())],
        );
        scope.complete(&[("applied", applied.as_str()), ("failed", failed.as_str())]);
        Ok(stats)
    }
}
