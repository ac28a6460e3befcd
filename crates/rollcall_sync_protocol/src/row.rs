//! Remote row envelope.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Length of the hyphenated UUID form, the only one accepted on the wire.
const KEY_LEN: usize = 36;

/// Returns true if `value` is a UUID in the fixed 36-character
/// hyphenated form.
///
/// Braced, URN and unhyphenated spellings are rejected even though they
/// name a valid UUID: foreign keys are compared as text remotely.
#[must_use]
pub fn is_well_formed_key(value: &str) -> bool {
    value.len() == KEY_LEN && Uuid::try_parse(value).is_ok()
}

/// Renders a timestamp the way the remote stores it (RFC 3339, UTC,
/// microseconds).
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A row as stored remotely.
///
/// The bookkeeping columns are shared by every table; the entity's own
/// columns are flattened next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Primary key.
    pub global_key: String,
    /// Owning account.
    pub owner_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    /// Entity columns.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RemoteRow {
    /// Returns an entity column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns an entity column as a string.
    #[must_use]
    pub fn text_column(&self, name: &str) -> Option<&str> {
        self.column(name).and_then(Value::as_str)
    }

    /// Parses the primary key, rejecting malformed values.
    pub fn parse_key(&self, table: &str) -> ProtocolResult<Uuid> {
        if !is_well_formed_key(&self.global_key) {
            return Err(ProtocolError::MalformedKey {
                table: table.to_string(),
                value: self.global_key.clone(),
            });
        }
        Uuid::try_parse(&self.global_key).map_err(|_| ProtocolError::MalformedKey {
            table: table.to_string(),
            value: self.global_key.clone(),
        })
    }

    /// Encodes the row as a JSON object.
    pub fn to_json(&self) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a row from a JSON object.
    pub fn from_json(value: Value) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
