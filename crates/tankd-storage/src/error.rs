// Diagnostic fields are read by the derive macros only
#![allow(unused_assignments)]

use miette::Diagnostic;
use tankd_core::TankdError;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the datastore
#[derive(Error, Debug, Diagnostic)]
pub enum StorageError {
    /// A record that must exist is absent
    #[error("No datastore record for {key}")]
    #[diagnostic(
        code(tankd_storage::missing_record),
        help("The record may have been removed by a concurrent key sync")
    )]
    MissingRecord { key: String },

    /// redb refused an operation
    #[error("{context}: {source}")]
    #[diagnostic(
        code(tankd_storage::redb),
        help("Check that the datastore file is readable and not held by another tankd")
    )]
    Redb {
        context: &'static str,
        #[source]
        source: BoxedSource,
    },

    /// A write transaction was misused or could not be committed
    #[error("Datastore transaction: {message}")]
    #[diagnostic(code(tankd_storage::transaction))]
    Transaction { message: String },

    /// A stored row is not the JSON we expect
    #[error("Malformed datastore row: {source}")]
    #[diagnostic(
        code(tankd_storage::malformed_row),
        help("The row was written by an incompatible version; remove it and re-escrow the key")
    )]
    MalformedRow {
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for datastore operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn missing_record(key: impl Into<String>) -> Self {
        Self::MissingRecord { key: key.into() }
    }

    pub fn redb(context: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Redb {
            context,
            source: Box::new(source),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }
}

macro_rules! from_redb {
    ($($ty:ty => $context:literal),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::redb($context, err)
                }
            }
        )*
    };
}

from_redb! {
    redb::Error => "redb",
    redb::DatabaseError => "Opening datastore",
    redb::TransactionError => "Starting transaction",
    redb::StorageError => "Datastore I/O",
    redb::TableError => "Opening table",
    redb::CommitError => "Committing transaction",
}

impl From<serde_json::Error> for StorageError {
    fn from(source: serde_json::Error) -> Self {
        StorageError::MalformedRow { source }
    }
}

impl From<StorageError> for TankdError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MissingRecord { key } => {
                TankdError::not_found(format!("Record not found: {}", key))
            }
            StorageError::MalformedRow { source } => {
                TankdError::serialization_error(
                    format!("Malformed datastore row: {}", source),
                    Some(Box::new(source)),
                )
            }
            other => TankdError::external(format!("Datastore error: {}", other), Some(Box::new(other))),
        }
    }
}
