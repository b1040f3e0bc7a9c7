//! Index maintenance errors

use thiserror::Error;

use crate::schema::SchemaError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type IndexResult<T> = Result<T, IndexError>;
