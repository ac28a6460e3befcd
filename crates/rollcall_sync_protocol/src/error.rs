//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A table name that is not part of the catalogue.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A global key that is not a well-formed UUID.
    #[error("malformed global key in table {table}: {value:?}")]
    MalformedKey {
        /// Table the row belongs to.
        table: String,
        /// The offending value.
        value: String,
    },

    /// A row is missing a column or carries one of the wrong type.
    #[error("invalid row in table {table}: {reason}")]
    InvalidRow {
        /// Table the row belongs to.
        table: String,
        /// Description of the problem.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an invalid row error.
    pub fn invalid_row(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            reason: reason.into(),
        }
    }
}
