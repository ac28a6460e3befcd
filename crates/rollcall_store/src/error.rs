//! Error types for the local store.

use crate::key::{GlobalKey, LocalKey};
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while reading or writing a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload or snapshot could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// No record with the given local key.
    #[error("record not found: {local_key} in table {table}")]
    RecordNotFound {
        /// Table that was searched.
        table: String,
        /// The local key that was not found.
        local_key: LocalKey,
    },

    /// A record with the same global key already exists in the table.
    #[error("duplicate global key {global_key} in table {table}")]
    DuplicateGlobalKey {
        /// Table where the collision occurred.
        table: String,
        /// The colliding global key.
        global_key: GlobalKey,
    },

    /// The table was never registered with the store.
    #[error("table not registered: {table}")]
    UnknownTable {
        /// Name of the table.
        table: String,
    },

    /// The table is not locked by the current transaction.
    #[error("table {table} is not part of this transaction")]
    TableNotInTransaction {
        /// Name of the table.
        table: String,
    },

    /// A record failed validation at the storage boundary.
    #[error("invalid record {global_key} in table {table}: {reason}")]
    InvalidRecord {
        /// Table holding the record.
        table: String,
        /// Global key of the record.
        global_key: GlobalKey,
        /// What is wrong with it.
        reason: String,
    },

    /// The transaction body asked for a rollback.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Snapshot was written by an incompatible format version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    SnapshotVersion {
        /// Version this build understands.
        expected: u16,
        /// Version found in the file.
        found: u16,
    },
}

impl StoreError {
    pub(crate) fn codec(message: impl ToString) -> Self {
        Self::Codec {
            message: message.to_string(),
        }
    }

    /// Creates an abort error, for use inside transaction bodies.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }
}
