//! Typed table handles.

use crate::error::StoreResult;
use crate::key::{GlobalKey, LocalKey, OwnerId};
use crate::record::{ConfirmedState, Entity, MergeOutcome, MergePolicy, Record};
use crate::store::LocalStore;
use crate::transaction::decode_record;
use chrono::{DateTime, Utc};
use std::marker::PhantomData;

/// A boxed payload edit, for batched updates.
pub type Edit<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Caller-facing handle to a table of `T`.
///
/// Every write made through this handle is a local mutation: the record is
/// stamped dirty and its `updated_at` moves forward. There is no way to
/// mark a record clean from here.
pub struct Table<T: Entity> {
    store: LocalStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self::new(self.store.clone())
    }
}

impl<T: Entity> Table<T> {
    pub(crate) fn new(store: LocalStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Returns the table name.
    pub fn name(&self) -> &'static str {
        T::TABLE
    }

    /// Inserts a new record with a freshly minted global key.
    pub fn insert(&self, owner: &OwnerId, data: T) -> StoreResult<Record<T>> {
        self.store
            .transaction_on(&[T::TABLE], |txn| txn.insert(owner.clone(), data))
    }

    /// Inserts a new record under a known global key.
    pub fn insert_with_global_key(
        &self,
        global_key: GlobalKey,
        owner: &OwnerId,
        data: T,
    ) -> StoreResult<Record<T>> {
        self.store.transaction_on(&[T::TABLE], |txn| {
            txn.insert_with_global_key(global_key, owner.clone(), data)
        })
    }

    /// Applies `edit` to one record.
    pub fn update(
        &self,
        local_key: LocalKey,
        edit: impl FnOnce(&mut T),
    ) -> StoreResult<Record<T>> {
        self.store
            .transaction_on(&[T::TABLE], |txn| txn.update(local_key, edit))
    }

    /// Applies several edits atomically: all of them or none.
    pub fn bulk_update(&self, edits: Vec<(LocalKey, Edit<T>)>) -> StoreResult<Vec<Record<T>>> {
        self.store.transaction_on(&[T::TABLE], |txn| {
            edits
                .into_iter()
                .map(|(local_key, edit)| txn.update(local_key, edit))
                .collect()
        })
    }

    /// Soft-deletes a record.
    pub fn soft_delete(&self, local_key: LocalKey) -> StoreResult<Record<T>> {
        self.store
            .transaction_on(&[T::TABLE], |txn| txn.soft_delete(local_key))
    }

    /// Reads a record by local key.
    pub fn get(&self, local_key: LocalKey) -> StoreResult<Option<Record<T>>> {
        self.store.read_table(T::TABLE, |data| {
            data.rows.get(&local_key).map(decode_record::<T>).transpose()
        })
    }

    /// Reads a record by global key.
    pub fn find_by_global_key(&self, global_key: GlobalKey) -> StoreResult<Option<Record<T>>> {
        find_by_global_key(&self.store, global_key)
    }

    /// Returns every record with unsynced local mutations.
    pub fn query_dirty(&self) -> StoreResult<Vec<Record<T>>> {
        query_dirty(&self.store)
    }

    /// Returns every record, tombstones included.
    ///
    /// **Warning**: This is a full table scan.
    pub fn scan_all(&self) -> StoreResult<Vec<Record<T>>> {
        self.store
            .read_table(T::TABLE, |data| data.rows.values().map(decode_record::<T>).collect())
    }

    /// Returns the number of records, tombstones included.
    pub fn count(&self) -> StoreResult<usize> {
        self.store.read_table(T::TABLE, |data| Ok(data.rows.len()))
    }
}

/// Identifies the exact state of a record that was sent to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Local key of the record.
    pub local_key: LocalKey,
    /// Revision observed when the record was read for pushing.
    pub revision: u64,
}

impl<T> From<&Record<T>> for Ack {
    fn from(record: &Record<T>) -> Self {
        Self {
            local_key: record.meta.local_key,
            revision: record.meta.revision,
        }
    }
}

/// Result of acknowledging a pushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckReport {
    /// Records marked clean.
    pub cleaned: usize,
    /// Records left dirty because they changed or vanished after the read.
    pub stale: usize,
}

/// Result of merging a batch of remote states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records inserted.
    pub inserted: usize,
    /// Records replaced.
    pub updated: usize,
    /// Records kept because the local copy was newer.
    pub kept_local: usize,
}

impl MergeReport {
    /// Total number of records that now hold remote state.
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::KeptLocal => self.kept_local += 1,
        }
    }
}

/// Sync engine handle to a table of `T`.
///
/// Writes made through this handle reflect remote state and leave records
/// clean. Each method is a single transaction.
pub struct SyncTable<T: Entity> {
    store: LocalStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for SyncTable<T> {
    fn clone(&self) -> Self {
        Self::new(self.store.clone())
    }
}

impl<T: Entity> SyncTable<T> {
    pub(crate) fn new(store: LocalStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Returns every record with unsynced local mutations.
    pub fn query_dirty(&self) -> StoreResult<Vec<Record<T>>> {
        query_dirty(&self.store)
    }

    /// Reads a record by global key.
    pub fn find_by_global_key(&self, global_key: GlobalKey) -> StoreResult<Option<Record<T>>> {
        find_by_global_key(&self.store, global_key)
    }

    /// Marks acknowledged records clean in one atomic write.
    ///
    /// A record edited after it was read for pushing keeps its dirty
    /// marker; the edit is pushed on a later cycle.
    pub fn acknowledge(&self, acks: &[Ack], synced_at: DateTime<Utc>) -> StoreResult<AckReport> {
        self.store.transaction_on(&[T::TABLE], |txn| {
            let mut report = AckReport::default();
            for ack in acks {
                if txn.acknowledge(T::TABLE, ack.local_key, ack.revision, synced_at)? {
                    report.cleaned += 1;
                } else {
                    report.stale += 1;
                }
            }
            Ok(report)
        })
    }

    /// Applies remote states in one atomic write.
    pub fn merge_confirmed(
        &self,
        states: Vec<ConfirmedState<T>>,
        policy: MergePolicy,
    ) -> StoreResult<MergeReport> {
        self.store.transaction_on(&[T::TABLE], |txn| {
            let mut report = MergeReport::default();
            for state in states {
                report.record(txn.merge_confirmed(state, policy)?);
            }
            Ok(report)
        })
    }

    /// Hard-removes the record with `global_key`. Returns false if absent.
    pub fn remove_by_global_key(&self, global_key: GlobalKey) -> StoreResult<bool> {
        self.store.transaction_on(&[T::TABLE], |txn| {
            txn.remove_by_global_key(T::TABLE, global_key)
        })
    }
}

fn query_dirty<T: Entity>(store: &LocalStore) -> StoreResult<Vec<Record<T>>> {
    store.read_table(T::TABLE, |data| {
        data.rows
            .values()
            .filter(|row| row.meta.sync.is_dirty())
            .map(decode_record::<T>)
            .collect()
    })
}

fn find_by_global_key<T: Entity>(
    store: &LocalStore,
    global_key: GlobalKey,
) -> StoreResult<Option<Record<T>>> {
    store.read_table(T::TABLE, |data| {
        data.by_global
            .get(&global_key)
            .and_then(|local_key| data.rows.get(local_key))
            .map(decode_record::<T>)
            .transpose()
    })
}
