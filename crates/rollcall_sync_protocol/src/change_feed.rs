//! Change-feed events pushed by the remote.

use crate::error::ProtocolResult;
use crate::kind::EntityKind;
use crate::row::RemoteRow;
use serde::{Deserialize, Serialize};

/// Type of a feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEventType {
    /// A row was inserted remotely.
    Insert,
    /// A row was updated remotely.
    Update,
    /// A row was removed remotely.
    Delete,
}

/// A single per-row event from the remote change feed.
///
/// Feed events describe state the remote has already committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// What happened to the row.
    pub event_type: FeedEventType,
    /// Table of the row.
    pub table: EntityKind,
    /// The row after the change (before it, for deletes).
    pub record: RemoteRow,
}

impl FeedEvent {
    /// Creates an insert event.
    pub fn insert(table: EntityKind, record: RemoteRow) -> Self {
        Self {
            event_type: FeedEventType::Insert,
            table,
            record,
        }
    }

    /// Creates an update event.
    pub fn update(table: EntityKind, record: RemoteRow) -> Self {
        Self {
            event_type: FeedEventType::Update,
            table,
            record,
        }
    }

    /// Creates a delete event.
    pub fn delete(table: EntityKind, record: RemoteRow) -> Self {
        Self {
            event_type: FeedEventType::Delete,
            table,
            record,
        }
    }

    /// Returns true for delete events.
    pub fn is_delete(&self) -> bool {
        self.event_type == FeedEventType::Delete
    }

    /// Decodes one line of a newline-delimited JSON feed.
    pub fn from_json_line(line: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Encodes the event as one line of newline-delimited JSON.
    pub fn to_json_line(&self) -> ProtocolResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
