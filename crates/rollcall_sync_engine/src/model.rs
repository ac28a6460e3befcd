//! Local shapes of the synchronized entities.
//!
//! Foreign-key fields hold the target's global key in its hyphenated
//! text form. Local keys never appear here.

use crate::mapper::SyncEntity;
use chrono::NaiveDate;
use rollcall_store::{Entity, GlobalKey};
use rollcall_sync_protocol::EntityKind;
use serde::{Deserialize, Serialize};

/// An academic period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    /// Display name, e.g. "Spring 2026".
    pub name: String,
    /// First day of the term.
    pub starts_on: NaiveDate,
    /// Last day of the term.
    pub ends_on: NaiveDate,
}

/// A student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Given name.
    pub given_name: String,
    /// Family name.
    pub family_name: String,
    /// School-issued number, if known.
    #[serde(default)]
    pub student_number: Option<String>,
}

/// A course taught within a term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    /// Global key of the term.
    pub term_id: String,
    /// Course code.
    pub code: String,
    /// Course title.
    pub title: String,
}

impl Offering {
    /// Creates an offering within `term`.
    pub fn new(term: GlobalKey, code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            term_id: term.to_string(),
            code: code.into(),
            title: title.into(),
        }
    }
}

/// A person taking an offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Global key of the person.
    pub person_id: String,
    /// Global key of the offering.
    pub offering_id: String,
}

impl Enrollment {
    /// Enrolls `person` in `offering`.
    pub fn new(person: GlobalKey, offering: GlobalKey) -> Self {
        Self {
            person_id: person.to_string(),
            offering_id: offering.to_string(),
        }
    }
}

/// A dated meeting of an offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Global key of the offering.
    pub offering_id: String,
    /// Date of the meeting.
    pub held_on: NaiveDate,
    /// What was covered.
    #[serde(default)]
    pub topic: Option<String>,
}

impl Session {
    /// Creates a session of `offering` on `held_on`.
    pub fn new(offering: GlobalKey, held_on: NaiveDate) -> Self {
        Self {
            offering_id: offering.to_string(),
            held_on,
            topic: None,
        }
    }
}

/// Attendance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    /// Attended.
    Present,
    /// Did not attend.
    Absent,
    /// Attended, late.
    Late,
    /// Absence excused.
    Excused,
}

/// A person's attendance status within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    /// Global key of the session.
    pub session_id: String,
    /// Global key of the person.
    pub person_id: String,
    /// Attendance status.
    pub status: MarkStatus,
}

impl Mark {
    /// Records `person`'s status in `session`.
    pub fn new(session: GlobalKey, person: GlobalKey, status: MarkStatus) -> Self {
        Self {
            session_id: session.to_string(),
            person_id: person.to_string(),
            status,
        }
    }
}

macro_rules! sync_entity {
    ($ty:ty, $kind:expr, [$($field:ident),*]) => {
        impl Entity for $ty {
            const TABLE: &'static str = $kind.table_name();
        }

        impl SyncEntity for $ty {
            const KIND: EntityKind = $kind;
            const FOREIGN_KEYS: &'static [&'static str] = &[$(stringify!($field)),*];

            #[allow(unused_variables)]
            fn foreign_key_value(&self, field: &str) -> Option<&str> {
                match field {
                    $(stringify!($field) => Some(self.$field.as_str()),)*
                    _ => None,
                }
            }
        }
    };
}

sync_entity!(Term, EntityKind::Term, []);
sync_entity!(Person, EntityKind::Person, []);
sync_entity!(Offering, EntityKind::Offering, [term_id]);
sync_entity!(Enrollment, EntityKind::Enrollment, [person_id, offering_id]);
sync_entity!(Session, EntityKind::Session, [offering_id]);
sync_entity!(Mark, EntityKind::Mark, [session_id, person_id]);
