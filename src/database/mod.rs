//! Database orchestrator
//!
//! Ties the storage, string and index subsystems together behind one handle:
//! - bootstrap of a fresh file and discovery of an existing one
//! - schema registration and the persisted registry
//! - record CRUD with index and string reference maintenance
//! - the operation log and its replay
//!
//! # Lock order
//!
//! record → array → used_count → statistical. Every call takes locks
//! in that order; a lock is never acquired while a later one in the order is
//! held.

mod crud;
#[allow(clippy::module_inception)]
mod database;
mod errors;
mod natives;
mod oplog;
mod registry;
mod replay;

pub use crud::InsertResult;
pub use database::Database;
pub use errors::{DbError, DbResult};
pub use natives::is_native;
pub use oplog::{read_lines, OpLog};
pub use replay::{LogCommand, ReplayStats};
