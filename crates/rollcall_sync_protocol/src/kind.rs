//! Catalogue of synchronized tables.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the six synchronized entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum EntityKind {
    /// An academic period.
    Term,
    /// A student.
    Person,
    /// A course taught within a term.
    Offering,
    /// A person taking an offering.
    Enrollment,
    /// A dated meeting of an offering.
    Session,
    /// A person's attendance status within a session.
    Mark,
}

impl EntityKind {
    /// Every kind, parents before children.
    ///
    /// Pushing in this order gives parents a chance to reach the remote
    /// before the children that reference them.
    pub const PUSH_ORDER: [EntityKind; 6] = [
        EntityKind::Term,
        EntityKind::Person,
        EntityKind::Offering,
        EntityKind::Enrollment,
        EntityKind::Session,
        EntityKind::Mark,
    ];

    /// Returns the remote (and local) table name.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            EntityKind::Term => "terms",
            EntityKind::Person => "people",
            EntityKind::Offering => "offerings",
            EntityKind::Enrollment => "enrollments",
            EntityKind::Session => "sessions",
            EntityKind::Mark => "marks",
        }
    }

    /// Foreign-key columns of this table and the tables they reference.
    #[must_use]
    pub const fn references(self) -> &'static [(&'static str, EntityKind)] {
        match self {
            EntityKind::Term | EntityKind::Person => &[],
            EntityKind::Offering => &[("term_id", EntityKind::Term)],
            EntityKind::Enrollment => &[
                ("person_id", EntityKind::Person),
                ("offering_id", EntityKind::Offering),
            ],
            EntityKind::Session => &[("offering_id", EntityKind::Offering)],
            EntityKind::Mark => &[
                ("session_id", EntityKind::Session),
                ("person_id", EntityKind::Person),
            ],
        }
    }

    /// Looks up a kind by table name.
    pub fn from_table_name(name: &str) -> ProtocolResult<Self> {
        Self::PUSH_ORDER
            .into_iter()
            .find(|kind| kind.table_name() == name)
            .ok_or_else(|| ProtocolError::UnknownTable(name.to_string()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table_name(s)
    }
}

impl From<EntityKind> for &'static str {
    fn from(kind: EntityKind) -> Self {
        kind.table_name()
    }
}

impl TryFrom<String> for EntityKind {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_table_name(&value)
    }
}
