//! Record keys and owner identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of the only accepted textual form of a global key.
const HYPHENATED_LEN: usize = 36;

/// Device-local identifier of a record.
///
/// Local keys are assigned per table in insertion order and are only
/// meaningful on the device that assigned them. They never appear in a
/// foreign key and are never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalKey(u64);

impl LocalKey {
    /// Creates a local key from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Globally unique identifier of a record.
///
/// Global keys are:
/// - Minted on the device when the record is created
/// - Immutable once assigned
/// - The only key used for cross-record references and as the remote
///   primary key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalKey(Uuid);

impl GlobalKey {
    /// Mints a new random global key.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses the fixed 36-character hyphenated form.
    ///
    /// Other textual UUID forms (simple, braced, URN) are rejected so that
    /// every key on the wire has exactly one spelling.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != HYPHENATED_LEN {
            return None;
        }
        Uuid::try_parse(text).ok().map(Self)
    }

    /// Returns the UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GlobalKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalKey({})", self.0)
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for GlobalKey {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl From<GlobalKey> for Uuid {
    fn from(key: GlobalKey) -> Self {
        key.0
    }
}

/// Identity of the account that owns a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        assert_ne!(GlobalKey::new(), GlobalKey::new());
    }

    #[test]
    fn parse_accepts_hyphenated_only() {
        let key = GlobalKey::new();
        let text = key.to_string();
        assert_eq!(GlobalKey::parse(&text), Some(key));

        let simple = key.as_uuid().simple().to_string();
        assert_eq!(GlobalKey::parse(&simple), None);

        let braced = key.as_uuid().braced().to_string();
        assert_eq!(GlobalKey::parse(&braced), None);

        assert_eq!(GlobalKey::parse(""), None);
        assert_eq!(GlobalKey::parse("not-a-key-not-a-key-not-a-key-00000"), None);
    }

    #[test]
    fn parse_is_case_insensitive() {
        let key = GlobalKey::new();
        let upper = key.to_string().to_uppercase();
        assert_eq!(GlobalKey::parse(&upper), Some(key));
    }

    #[test]
    fn local_key_ordering() {
        assert!(LocalKey::new(1) < LocalKey::new(2));
        assert_eq!(LocalKey::new(3).to_string(), "#3");
    }
}
