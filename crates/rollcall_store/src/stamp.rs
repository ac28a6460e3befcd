//! The write hook applied to every record mutation.
//!
//! Every insert and update in the store passes through [`stamp`]. Callers
//! never set the dirty/clean marker or the timestamps themselves; they
//! state an intent and the hook derives the bookkeeping from it. Only the
//! sync engine's capability handle can express an intent other than
//! [`WriteIntent::Local`].

use crate::record::{RecordMeta, SyncMarker};
use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Why a record is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteIntent {
    /// A local mutation (create, edit, soft delete).
    Local,
    /// The remote store acknowledged the record's current state.
    Acknowledged {
        /// Acknowledgement time.
        synced_at: DateTime<Utc>,
    },
    /// Remote state is being applied verbatim.
    Confirmed {
        /// Remote creation time.
        created_at: DateTime<Utc>,
        /// Remote update time.
        updated_at: DateTime<Utc>,
        /// Remote tombstone flag.
        deleted: bool,
        /// Time the state was applied.
        synced_at: DateTime<Utc>,
    },
}

/// Current time at the precision stored remotely (microseconds).
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Returns a timestamp strictly after `previous`, normally "now".
pub(crate) fn after(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

/// Applies the bookkeeping for `intent` to `meta`.
///
/// `fresh` is true when the record is being created by this write.
pub(crate) fn stamp(meta: &mut RecordMeta, intent: WriteIntent, fresh: bool) {
    match intent {
        WriteIntent::Local => {
            if fresh {
                let at = now();
                meta.created_at = at;
                meta.updated_at = at;
            } else {
                meta.updated_at = after(meta.updated_at);
            }
            meta.sync = SyncMarker::Dirty;
        }
        WriteIntent::Acknowledged { synced_at } => {
            meta.sync = SyncMarker::Clean { synced_at };
        }
        WriteIntent::Confirmed {
            created_at,
            updated_at,
            deleted,
            synced_at,
        } => {
            meta.created_at = created_at;
            meta.updated_at = updated_at;
            meta.deleted = deleted;
            meta.sync = SyncMarker::Clean { synced_at };
        }
    }
    meta.revision += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{GlobalKey, LocalKey, OwnerId};

    fn blank() -> RecordMeta {
        RecordMeta {
            local_key: LocalKey::new(1),
            global_key: GlobalKey::new(),
            owner: OwnerId::new("o"),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            deleted: false,
            sync: SyncMarker::Dirty,
            revision: 0,
        }
    }

    #[test]
    fn local_write_marks_dirty_and_advances() {
        let mut meta = blank();
        stamp(&mut meta, WriteIntent::Local, true);
        assert!(meta.sync.is_dirty());
        assert_eq!(meta.created_at, meta.updated_at);
        assert_eq!(meta.revision, 1);

        let before = meta.updated_at;
        stamp(&mut meta, WriteIntent::Local, false);
        stamp(&mut meta, WriteIntent::Local, false);
        assert!(meta.updated_at > before);
        assert!(meta.sync.is_dirty());
        assert_eq!(meta.revision, 3);
    }

    #[test]
    fn after_is_strict_even_for_future_times() {
        let future = Utc::now() + Duration::hours(1);
        assert!(after(future) > future);
    }

    #[test]
    fn acknowledged_keeps_timestamps() {
        let mut meta = blank();
        stamp(&mut meta, WriteIntent::Local, true);
        let updated = meta.updated_at;
        let at = now();
        stamp(&mut meta, WriteIntent::Acknowledged { synced_at: at }, false);
        assert_eq!(meta.updated_at, updated);
        assert_eq!(meta.sync, SyncMarker::Clean { synced_at: at });
    }

    #[test]
    fn confirmed_copies_remote_fields() {
        let mut meta = blank();
        let created = now() - Duration::days(2);
        let updated = now() - Duration::days(1);
        let at = now();
        stamp(
            &mut meta,
            WriteIntent::Confirmed {
                created_at: created,
                updated_at: updated,
                deleted: true,
                synced_at: at,
            },
            true,
        );
        assert_eq!(meta.created_at, created);
        assert_eq!(meta.updated_at, updated);
        assert!(meta.deleted);
        assert!(!meta.sync.is_dirty());
    }
}
