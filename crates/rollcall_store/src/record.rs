//! Record envelope and entity contract.

use crate::key::{GlobalKey, LocalKey, OwnerId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed table entry.
///
/// Implementors are the local shapes of synchronized entities. The store
/// encodes them as CBOR, so any serde-serializable struct works.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the table holding this entity.
    const TABLE: &'static str;
}

/// Whether a record matches the last known remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncMarker {
    /// Mutated locally since the last confirmed push.
    Dirty,
    /// Matches remote state as of `synced_at`.
    Clean {
        /// When the remote state was confirmed.
        synced_at: DateTime<Utc>,
    },
}

impl SyncMarker {
    /// Returns true if the record has unsynced local mutations.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self, SyncMarker::Dirty)
    }

    /// Returns when the record was last confirmed, if clean.
    #[must_use]
    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncMarker::Dirty => None,
            SyncMarker::Clean { synced_at } => Some(*synced_at),
        }
    }
}

/// Bookkeeping fields carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Device-local key.
    pub local_key: LocalKey,
    /// Global key, immutable once assigned.
    pub global_key: GlobalKey,
    /// Owning account.
    pub owner: OwnerId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Dirty/clean marker.
    pub sync: SyncMarker,
    /// Local write counter, bumped on every write. Never transmitted.
    pub revision: u64,
}

impl RecordMeta {
    /// Checks the invariants enforced at the storage boundary.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.updated_at < self.created_at {
            return Err(format!(
                "updated_at {} precedes created_at {}",
                self.updated_at, self.created_at
            ));
        }
        if let SyncMarker::Clean { synced_at } = self.sync {
            if synced_at.timestamp() <= 0 {
                return Err("clean marker without a sync time".into());
            }
        }
        Ok(())
    }
}

/// A record read from the store: metadata plus the typed payload.
///
/// This is a copy; changing it has no effect on the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    /// Bookkeeping fields.
    pub meta: RecordMeta,
    /// Entity payload.
    pub data: T,
}

impl<T> Record<T> {
    /// Returns the local key.
    pub fn local_key(&self) -> LocalKey {
        self.meta.local_key
    }

    /// Returns the global key.
    pub fn global_key(&self) -> GlobalKey {
        self.meta.global_key
    }

    /// Returns true if the record has unsynced local mutations.
    pub fn is_dirty(&self) -> bool {
        self.meta.sync.is_dirty()
    }

    /// Returns true if the record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.meta.deleted
    }
}

/// Remote state of a record, as confirmed by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedState<T> {
    /// Global key of the record.
    pub global_key: GlobalKey,
    /// Owning account.
    pub owner: OwnerId,
    /// Creation time recorded remotely.
    pub created_at: DateTime<Utc>,
    /// Last mutation time recorded remotely.
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Entity payload.
    pub data: T,
}

/// How incoming remote state is merged into an existing local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Remote state replaces the local record unless the record carries
    /// a pending edit newer than the remote state. Such an edit is pushed
    /// on the next cycle.
    #[default]
    RemoteWins,
    /// Any local record newer than the remote state is kept, clean or not.
    LastWriterWins,
}

/// What a merge did to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local record existed; one was inserted clean.
    Inserted,
    /// The local record was replaced and marked clean.
    Updated,
    /// The local record was kept because of the merge policy.
    KeptLocal,
}
