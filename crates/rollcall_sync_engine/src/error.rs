//! Error types for the sync engine.

use crate::mapper::ReferenceError;
use rollcall_store::StoreError;
use rollcall_sync_protocol::ProtocolError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A foreign key does not hold a well-formed global key.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// Request failed in transit.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store refused the request.
    #[error("remote rejected {table}: {message}")]
    RemoteRejection {
        /// Table the request was for.
        table: String,
        /// Message returned by the remote.
        message: String,
    },

    /// Local store transaction failed.
    #[error("local store error: {0}")]
    LocalStore(#[from] StoreError),

    /// Remote data could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A remote URL could not be parsed or resolved.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// One or more tables failed during a phase.
    #[error("{phase} phase failed: {summary}")]
    PhaseFailed {
        /// Phase that failed.
        phase: &'static str,
        /// Failed tables and their errors.
        summary: String,
    },

    /// A phase panicked.
    #[error("sync cycle panicked: {0}")]
    Panicked(String),

    /// Background tasks are already running for this engine.
    #[error("sync engine already started")]
    AlreadyStarted,
}

/// Classification of sync errors by recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Record stays dirty until its reference resolves.
    Reference,
    /// The affected phase is retried on the next cycle.
    Network,
    /// Record stays dirty; no automatic remediation.
    RemoteRejection,
    /// Fatal to the current cycle only.
    LocalStore,
    /// Anything else.
    Internal,
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a remote rejection.
    pub fn rejected(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteRejection {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying on a later cycle may succeed without any
    /// other change.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout(_) => true,
            SyncError::Reference(_) => true,
            _ => false,
        }
    }

    /// Returns the error's class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Reference(_) => ErrorKind::Reference,
            SyncError::Network { .. } | SyncError::Timeout(_) => ErrorKind::Network,
            SyncError::RemoteRejection { .. } => ErrorKind::RemoteRejection,
            SyncError::LocalStore(_) => ErrorKind::LocalStore,
            SyncError::Protocol(_)
            | SyncError::InvalidUrl(_)
            | SyncError::PhaseFailed { .. }
            | SyncError::Panicked(_)
            | SyncError::AlreadyStarted => ErrorKind::Internal,
        }
    }
}
