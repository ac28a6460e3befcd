//! Multi-table transactions with staged writes.

use crate::error::{StoreError, StoreResult};
use crate::key::{GlobalKey, LocalKey, OwnerId};
use crate::record::{ConfirmedState, Entity, MergeOutcome, MergePolicy, Record, RecordMeta, SyncMarker};
use crate::stamp::{self, WriteIntent};
use crate::store::{StoredRow, TableData};
use chrono::{DateTime, Utc};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;

/// A staged write, applied to the table on commit.
#[derive(Debug, Clone)]
enum PendingWrite {
    /// Insert or replace the row.
    Put(StoredRow),
    /// Hard-remove the row.
    Remove,
}

/// An open read/write transaction.
///
/// The tables taking part are locked for the lifetime of the transaction.
/// Writes are staged and only reach the tables when the transaction body
/// returns `Ok`; an error drops every staged write.
pub struct Transaction<'a> {
    tables: BTreeMap<String, MutexGuard<'a, TableData>>,
    pending: BTreeMap<String, BTreeMap<LocalKey, PendingWrite>>,
    next_keys: BTreeMap<String, u64>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(tables: BTreeMap<String, MutexGuard<'a, TableData>>) -> Self {
        Self {
            tables,
            pending: BTreeMap::new(),
            next_keys: BTreeMap::new(),
        }
    }

    /// Inserts a new record, minting its global key.
    pub fn insert<T: Entity>(&mut self, owner: OwnerId, data: T) -> StoreResult<Record<T>> {
        self.insert_with_global_key(GlobalKey::new(), owner, data)
    }

    /// Inserts a new record under a caller-chosen global key.
    pub fn insert_with_global_key<T: Entity>(
        &mut self,
        global_key: GlobalKey,
        owner: OwnerId,
        data: T,
    ) -> StoreResult<Record<T>> {
        if self.lookup_global(T::TABLE, global_key)?.is_some() {
            return Err(StoreError::DuplicateGlobalKey {
                table: T::TABLE.into(),
                global_key,
            });
        }
        let local_key = self.allocate_key(T::TABLE)?;
        let mut meta = blank_meta(local_key, global_key, owner);
        stamp::stamp(&mut meta, WriteIntent::Local, true);
        self.put_record(&meta, &data)?;
        Ok(Record { meta, data })
    }

    /// Applies `edit` to the record's payload.
    pub fn update<T: Entity>(
        &mut self,
        local_key: LocalKey,
        edit: impl FnOnce(&mut T),
    ) -> StoreResult<Record<T>> {
        let mut record = self.require::<T>(local_key)?;
        edit(&mut record.data);
        stamp::stamp(&mut record.meta, WriteIntent::Local, false);
        self.put_record(&record.meta, &record.data)?;
        Ok(record)
    }

    /// Marks the record as a tombstone.
    ///
    /// The record stays in the table so the deletion itself can sync.
    pub fn soft_delete<T: Entity>(&mut self, local_key: LocalKey) -> StoreResult<Record<T>> {
        let mut record = self.require::<T>(local_key)?;
        record.meta.deleted = true;
        stamp::stamp(&mut record.meta, WriteIntent::Local, false);
        self.put_record(&record.meta, &record.data)?;
        Ok(record)
    }

    /// Reads a record by local key, seeing this transaction's writes.
    pub fn get<T: Entity>(&self, local_key: LocalKey) -> StoreResult<Option<Record<T>>> {
        self.row(T::TABLE, local_key)?
            .map(|row| decode_record(&row))
            .transpose()
    }

    /// Reads a record by global key, seeing this transaction's writes.
    pub fn find_by_global_key<T: Entity>(
        &self,
        global_key: GlobalKey,
    ) -> StoreResult<Option<Record<T>>> {
        match self.lookup_global(T::TABLE, global_key)? {
            Some(local_key) => self.get(local_key),
            None => Ok(None),
        }
    }

    /// Returns every record of the table, seeing this transaction's writes.
    pub fn scan<T: Entity>(&self) -> StoreResult<Vec<Record<T>>> {
        let base = self.base(T::TABLE)?;
        let staged = self.pending.get(T::TABLE);
        let mut rows: BTreeMap<LocalKey, &StoredRow> =
            base.rows.iter().map(|(k, row)| (*k, row)).collect();
        if let Some(staged) = staged {
            for (key, write) in staged {
                match write {
                    PendingWrite::Put(row) => {
                        rows.insert(*key, row);
                    }
                    PendingWrite::Remove => {
                        rows.remove(key);
                    }
                }
            }
        }
        rows.values().map(|row| decode_record(row)).collect()
    }

    /// Marks a record clean if it has not been written since `revision`.
    ///
    /// Returns false if the record changed or vanished in the meantime.
    pub(crate) fn acknowledge(
        &mut self,
        table: &str,
        local_key: LocalKey,
        revision: u64,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut row) = self.row(table, local_key)? else {
            return Ok(false);
        };
        if row.meta.revision != revision {
            return Ok(false);
        }
        stamp::stamp(&mut row.meta, WriteIntent::Acknowledged { synced_at }, false);
        self.stage(table, local_key, PendingWrite::Put(row));
        Ok(true)
    }

    /// Applies confirmed remote state, inserting the record if needed.
    pub(crate) fn merge_confirmed<T: Entity>(
        &mut self,
        state: ConfirmedState<T>,
        policy: MergePolicy,
    ) -> StoreResult<MergeOutcome> {
        let intent = WriteIntent::Confirmed {
            created_at: state.created_at,
            updated_at: state.updated_at,
            deleted: state.deleted,
            synced_at: stamp::now(),
        };

        let (meta, outcome) = match self.lookup_global(T::TABLE, state.global_key)? {
            Some(local_key) => {
                let existing = self.require::<T>(local_key)?;
                if keeps_local(policy, &existing.meta, state.updated_at) {
                    return Ok(MergeOutcome::KeptLocal);
                }
                let mut meta = existing.meta;
                meta.owner = state.owner;
                stamp::stamp(&mut meta, intent, false);
                (meta, MergeOutcome::Updated)
            }
            None => {
                let local_key = self.allocate_key(T::TABLE)?;
                let mut meta = blank_meta(local_key, state.global_key, state.owner);
                stamp::stamp(&mut meta, intent, true);
                (meta, MergeOutcome::Inserted)
            }
        };

        meta.validate().map_err(|reason| StoreError::InvalidRecord {
            table: T::TABLE.into(),
            global_key: state.global_key,
            reason,
        })?;
        self.put_record(&meta, &state.data)?;
        Ok(outcome)
    }

    /// Hard-removes a record. Returns false if it did not exist.
    pub(crate) fn remove_by_global_key(
        &mut self,
        table: &str,
        global_key: GlobalKey,
    ) -> StoreResult<bool> {
        match self.lookup_global(table, global_key)? {
            Some(local_key) => {
                self.stage(table, local_key, PendingWrite::Remove);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Applies every staged write to the locked tables.
    pub(crate) fn commit(mut self) {
        for (name, next) in std::mem::take(&mut self.next_keys) {
            if let Some(table) = self.tables.get_mut(&name) {
                table.next_local_key = table.next_local_key.max(next);
            }
        }
        for (name, writes) in std::mem::take(&mut self.pending) {
            let Some(table) = self.tables.get_mut(&name) else {
                continue;
            };
            for (local_key, write) in writes {
                match write {
                    PendingWrite::Put(row) => table.put(local_key, row),
                    PendingWrite::Remove => table.remove(local_key),
                }
            }
        }
    }

    fn base(&self, table: &str) -> StoreResult<&TableData> {
        self.tables
            .get(table)
            .map(|guard| &**guard)
            .ok_or_else(|| StoreError::TableNotInTransaction {
                table: table.into(),
            })
    }

    fn row(&self, table: &str, local_key: LocalKey) -> StoreResult<Option<StoredRow>> {
        let base = self.base(table)?;
        if let Some(write) = self.pending.get(table).and_then(|w| w.get(&local_key)) {
            return Ok(match write {
                PendingWrite::Put(row) => Some(row.clone()),
                PendingWrite::Remove => None,
            });
        }
        Ok(base.rows.get(&local_key).cloned())
    }

    fn require<T: Entity>(&self, local_key: LocalKey) -> StoreResult<Record<T>> {
        self.get(local_key)?.ok_or_else(|| StoreError::RecordNotFound {
            table: T::TABLE.into(),
            local_key,
        })
    }

    fn lookup_global(&self, table: &str, global_key: GlobalKey) -> StoreResult<Option<LocalKey>> {
        let base = self.base(table)?;
        let staged = self.pending.get(table);
        if let Some(staged) = staged {
            for (key, write) in staged {
                if let PendingWrite::Put(row) = write {
                    if row.meta.global_key == global_key {
                        return Ok(Some(*key));
                    }
                }
            }
        }
        match base.by_global.get(&global_key) {
            Some(key) if matches!(staged.and_then(|s| s.get(key)), Some(PendingWrite::Remove)) => {
                Ok(None)
            }
            Some(key) => Ok(Some(*key)),
            None => Ok(None),
        }
    }

    fn allocate_key(&mut self, table: &str) -> StoreResult<LocalKey> {
        let start = self.base(table)?.next_local_key;
        let next = self.next_keys.entry(table.to_string()).or_insert(start);
        let key = LocalKey::new(*next);
        *next += 1;
        Ok(key)
    }

    fn put_record<T: Entity>(&mut self, meta: &RecordMeta, data: &T) -> StoreResult<()> {
        let payload = encode(data)?;
        self.stage(
            T::TABLE,
            meta.local_key,
            PendingWrite::Put(StoredRow {
                meta: meta.clone(),
                payload,
            }),
        );
        Ok(())
    }

    fn stage(&mut self, table: &str, local_key: LocalKey, write: PendingWrite) {
        self.pending
            .entry(table.to_string())
            .or_default()
            .insert(local_key, write);
    }
}

/// Returns true if `local` must survive incoming state stamped `incoming`.
///
/// Remote state older than a pending local edit is never newer confirmed
/// state, whatever the policy.
fn keeps_local(policy: MergePolicy, local: &RecordMeta, incoming: DateTime<Utc>) -> bool {
    if local.updated_at <= incoming {
        return false;
    }
    match policy {
        MergePolicy::RemoteWins => local.sync.is_dirty(),
        MergePolicy::LastWriterWins => true,
    }
}

fn blank_meta(local_key: LocalKey, global_key: GlobalKey, owner: OwnerId) -> RecordMeta {
    RecordMeta {
        local_key,
        global_key,
        owner,
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
        deleted: false,
        sync: SyncMarker::Dirty,
        revision: 0,
    }
}

pub(crate) fn encode<T: Entity>(data: &T) -> StoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(data, &mut bytes).map_err(StoreError::codec)?;
    Ok(bytes)
}

pub(crate) fn decode_record<T: Entity>(row: &StoredRow) -> StoreResult<Record<T>> {
    let data: T = ciborium::from_reader(row.payload.as_slice()).map_err(StoreError::codec)?;
    Ok(Record {
        meta: row.meta.clone(),
        data,
    })
}
