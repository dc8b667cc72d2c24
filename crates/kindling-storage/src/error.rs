//! Errors raised by the redb backend.

use std::path::PathBuf;
use thiserror::Error;

use kindling_core::ExtensionError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The directory that should hold the database file could not be created.
    #[error("cannot create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("cannot begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("cannot open table: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage failure: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("cannot commit: {0}")]
    Commit(#[from] redb::CommitError),

    /// A stored value is not valid JSON.
    #[error("value at {namespace}/{key} is corrupt: {source}")]
    Corrupt {
        namespace: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode value for {namespace}/{key}: {source}")]
    Encode {
        namespace: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Namespaces and keys share a table separated by `\0`.
    #[error("{part} {value:?} contains a NUL byte")]
    NulByte { part: &'static str, value: String },
}

impl From<Error> for ExtensionError {
    fn from(e: Error) -> Self {
        ExtensionError::Storage(e.to_string())
    }
}
