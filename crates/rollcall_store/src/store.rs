//! The local store: tables, transactions, checkpoints and snapshots.

use crate::error::{StoreError, StoreResult};
use crate::key::{GlobalKey, LocalKey, OwnerId};
use crate::record::{Entity, RecordMeta};
use crate::stamp;
use crate::table::{SyncTable, Table};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// A stored row: bookkeeping plus the CBOR-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub(crate) meta: RecordMeta,
    pub(crate) payload: Vec<u8>,
}

/// Contents of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableData {
    pub(crate) rows: BTreeMap<LocalKey, StoredRow>,
    /// Global key index, rebuilt on load.
    #[serde(skip)]
    pub(crate) by_global: HashMap<GlobalKey, LocalKey>,
    /// Next local key to hand out. Local keys are never reused.
    pub(crate) next_local_key: u64,
}

impl Default for TableData {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_global: HashMap::new(),
            next_local_key: 1,
        }
    }
}

impl TableData {
    pub(crate) fn put(&mut self, local_key: LocalKey, row: StoredRow) {
        self.by_global.insert(row.meta.global_key, local_key);
        self.rows.insert(local_key, row);
    }

    pub(crate) fn remove(&mut self, local_key: LocalKey) {
        if let Some(row) = self.rows.remove(&local_key) {
            self.by_global.remove(&row.meta.global_key);
        }
    }

    /// Rebuilds the index and checks every row. Used when loading.
    fn reindex(&mut self, table: &str) -> StoreResult<()> {
        self.by_global.clear();
        let mut highest = 0;
        for (local_key, row) in &self.rows {
            let global_key = row.meta.global_key;
            row.meta
                .validate()
                .map_err(|reason| StoreError::InvalidRecord {
                    table: table.into(),
                    global_key,
                    reason,
                })?;
            if self.by_global.insert(global_key, *local_key).is_some() {
                return Err(StoreError::DuplicateGlobalKey {
                    table: table.into(),
                    global_key,
                });
            }
            highest = highest.max(local_key.as_u64());
        }
        self.next_local_key = self.next_local_key.max(highest + 1);
        Ok(())
    }
}

/// Per-table row counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub table: String,
    /// Rows in the table, tombstones included.
    pub total: usize,
    /// Rows with unsynced local mutations.
    pub dirty: usize,
    /// Soft-deleted rows.
    pub tombstones: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u16,
    tables: BTreeMap<String, TableData>,
    checkpoints: BTreeMap<OwnerId, DateTime<Utc>>,
}

struct StoreInner {
    tables: RwLock<BTreeMap<String, Arc<Mutex<TableData>>>>,
    checkpoints: Mutex<BTreeMap<OwnerId, DateTime<Utc>>>,
}

/// An embedded store of typed tables with per-record dirty tracking.
///
/// Handles are cheap to clone and share the same underlying tables.
///
/// # Mutation paths
///
/// Records can only be written through a [`Transaction`]. Callers reach it
/// via [`Table`] (local edits, always marked dirty) or [`SyncTable`]
/// (remote acknowledgements and confirmed remote state, marked clean).
/// Both go through the same stamping hook, so a record can never be
/// mutated and left clean.
///
/// # Locking
///
/// Each table has a single writer lock. A transaction locks its tables in
/// name order for its whole duration, so two writers on the same table are
/// always serialized.
///
/// # Example
///
/// ```rust,ignore
/// let store = LocalStore::new();
/// let terms = store.table::<Term>();
/// let term = terms.insert(&owner, Term::new("Spring"))?;
/// assert!(term.is_dirty());
/// ```
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(BTreeMap::new(), BTreeMap::new())
    }

    fn from_parts(
        tables: BTreeMap<String, TableData>,
        checkpoints: BTreeMap<OwnerId, DateTime<Utc>>,
    ) -> Self {
        let tables = tables
            .into_iter()
            .map(|(name, data)| (name, Arc::new(Mutex::new(data))))
            .collect();
        Self {
            inner: Arc::new(StoreInner {
                tables: RwLock::new(tables),
                checkpoints: Mutex::new(checkpoints),
            }),
        }
    }

    /// Registers a table. Registering twice is a no-op.
    pub fn register<T: Entity>(&self) {
        self.register_table(T::TABLE);
    }

    fn register_table(&self, name: &str) {
        if self.inner.tables.read().contains_key(name) {
            return;
        }
        self.inner
            .tables
            .write()
            .entry(name.to_string())
            .or_default();
    }

    /// Returns the caller-facing handle for a table, registering it.
    pub fn table<T: Entity>(&self) -> Table<T> {
        self.register::<T>();
        Table::new(self.clone())
    }

    /// Returns the sync engine's handle for a table, registering it.
    ///
    /// This handle can mark records clean and apply remote state. It is
    /// meant for the sync engine only; application code uses [`table`].
    ///
    /// [`table`]: LocalStore::table
    pub fn sync_table<T: Entity>(&self) -> SyncTable<T> {
        self.register::<T>();
        SyncTable::new(self.clone())
    }

    /// Returns the names of all registered tables.
    pub fn table_names(&self) -> Vec<String> {
        self.inner.tables.read().keys().cloned().collect()
    }

    /// Runs `f` in a transaction over every registered table.
    ///
    /// All writes made by `f` are applied if it returns `Ok`, none if it
    /// returns `Err`.
    pub fn transaction<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<R>,
    {
        let names = self.table_names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.transaction_on(&names, f)
    }

    /// Runs `f` in a transaction over the named tables only.
    pub(crate) fn transaction_on<F, R>(&self, names: &[&str], f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<R>,
    {
        let handles = self.handles(names)?;
        let guards: BTreeMap<String, MutexGuard<'_, TableData>> = handles
            .iter()
            .map(|(name, table)| (name.clone(), table.lock()))
            .collect();

        let mut txn = Transaction::new(guards);
        let result = f(&mut txn)?;
        txn.commit();
        Ok(result)
    }

    /// Runs `f` against a table's committed contents.
    pub(crate) fn read_table<F, R>(&self, name: &str, f: F) -> StoreResult<R>
    where
        F: FnOnce(&TableData) -> StoreResult<R>,
    {
        let handle = self.handle(name)?;
        let guard = handle.lock();
        f(&guard)
    }

    /// Returns table handles sorted by name, which is the lock order.
    fn handles(&self, names: &[&str]) -> StoreResult<Vec<(String, Arc<Mutex<TableData>>)>> {
        let tables = self.inner.tables.read();
        let mut sorted: Vec<&str> = names.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .into_iter()
            .map(|name| {
                tables
                    .get(name)
                    .map(|table| (name.to_string(), Arc::clone(table)))
                    .ok_or_else(|| StoreError::UnknownTable { table: name.into() })
            })
            .collect()
    }

    fn handle(&self, name: &str) -> StoreResult<Arc<Mutex<TableData>>> {
        self.inner
            .tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable { table: name.into() })
    }

    /// Returns the last successful pull time for `owner`.
    pub fn checkpoint(&self, owner: &OwnerId) -> Option<DateTime<Utc>> {
        self.inner.checkpoints.lock().get(owner).copied()
    }

    /// Advances the pull checkpoint for `owner`.
    ///
    /// The stored value always strictly increases: if `to` is not after
    /// the current checkpoint, the checkpoint moves forward by the
    /// smallest step instead. Returns the stored value.
    pub fn advance_checkpoint(&self, owner: &OwnerId, to: DateTime<Utc>) -> DateTime<Utc> {
        let mut checkpoints = self.inner.checkpoints.lock();
        let next = match checkpoints.get(owner) {
            Some(current) if to <= *current => stamp::after(*current),
            _ => to,
        };
        checkpoints.insert(owner.clone(), next);
        next
    }

    /// Returns row counts for every table.
    pub fn summary(&self) -> Vec<TableSummary> {
        let handles = self.inner.tables.read().clone();
        handles
            .into_iter()
            .map(|(table, data)| {
                let data = data.lock();
                TableSummary {
                    table,
                    total: data.rows.len(),
                    dirty: data.rows.values().filter(|r| r.meta.sync.is_dirty()).count(),
                    tombstones: data.rows.values().filter(|r| r.meta.deleted).count(),
                }
            })
            .collect()
    }

    /// Returns all checkpoints.
    pub fn checkpoints(&self) -> BTreeMap<OwnerId, DateTime<Utc>> {
        self.inner.checkpoints.lock().clone()
    }

    /// Writes the whole store to `path` as CBOR.
    ///
    /// The snapshot is written next to `path` and renamed into place, so a
    /// crash never leaves a half-written file behind.
    pub fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let snapshot = {
            // Read before the tables: a stored checkpoint must never be
            // ahead of the stored rows.
            let checkpoints = self.checkpoints();
            let names = self.table_names();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let handles = self.handles(&names)?;
            let tables = handles
                .iter()
                .map(|(name, table)| (name.clone(), table.lock().clone()))
                .collect();
            Snapshot {
                version: SNAPSHOT_VERSION,
                tables,
                checkpoints,
            }
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&snapshot, &mut bytes).map_err(StoreError::codec)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    /// Opens a store from a snapshot file, or an empty store if it is absent.
    pub fn open_snapshot(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let snapshot: Snapshot =
            ciborium::from_reader(bytes.as_slice()).map_err(StoreError::codec)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::SnapshotVersion {
                expected: SNAPSHOT_VERSION,
                found: snapshot.version,
            });
        }

        let mut tables = snapshot.tables;
        for (name, data) in tables.iter_mut() {
            data.reindex(name)?;
        }
        tracing::debug!(path = %path.display(), tables = tables.len(), "snapshot loaded");
        Ok(Self::from_parts(tables, snapshot.checkpoints))
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("tables", &self.table_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "notes";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tag {
        label: String,
    }

    impl Entity for Tag {
        const TABLE: &'static str = "tags";
    }

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    #[test]
    fn unknown_table_is_an_error() {
        let store = LocalStore::new();
        let result = store.transaction_on(&["missing"], |_| Ok(()));
        assert!(matches!(result, Err(StoreError::UnknownTable { .. })));
    }

    #[test]
    fn failed_transaction_changes_nothing() {
        let store = LocalStore::new();
        store.register::<Note>();
        store.register::<Tag>();
        let owner = OwnerId::new("o");

        let result: StoreResult<()> = store.transaction(|txn| {
            txn.insert(owner.clone(), note("a"))?;
            txn.insert(owner.clone(), Tag { label: "x".into() })?;
            Err(StoreError::aborted("rollback"))
        });
        assert!(result.is_err());
        assert_eq!(store.table::<Note>().count().unwrap(), 0);
        assert_eq!(store.table::<Tag>().count().unwrap(), 0);

        // Local keys reserved by the aborted transaction are not burned.
        let first = store.table::<Note>().insert(&owner, note("b")).unwrap();
        assert_eq!(first.local_key(), LocalKey::new(1));
    }

    #[test]
    fn transaction_spans_tables() {
        let store = LocalStore::new();
        store.register::<Note>();
        store.register::<Tag>();
        let owner = OwnerId::new("o");

        let (n, t) = store
            .transaction(|txn| {
                let n = txn.insert(owner.clone(), note("a"))?;
                let t = txn.insert(owner.clone(), Tag { label: "x".into() })?;
                Ok((n, t))
            })
            .unwrap();

        assert!(store.table::<Note>().get(n.local_key()).unwrap().is_some());
        assert!(store.table::<Tag>().get(t.local_key()).unwrap().is_some());
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = LocalStore::new();
        store.register::<Note>();
        let owner = OwnerId::new("o");

        store
            .transaction(|txn| {
                let created = txn.insert(owner.clone(), note("a"))?;
                let found = txn.find_by_global_key::<Note>(created.global_key())?;
                assert_eq!(found.map(|r| r.data), Some(note("a")));
                txn.update::<Note>(created.local_key(), |n| n.text = "b".into())?;
                assert_eq!(txn.scan::<Note>()?.len(), 1);
                assert_eq!(txn.scan::<Note>()?[0].data, note("b"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn checkpoint_strictly_advances() {
        let store = LocalStore::new();
        let owner = OwnerId::new("o");
        assert_eq!(store.checkpoint(&owner), None);

        let t1 = stamp::now();
        assert_eq!(store.advance_checkpoint(&owner, t1), t1);
        let t2 = store.advance_checkpoint(&owner, t1);
        assert!(t2 > t1);
        let t3 = store.advance_checkpoint(&owner, t1 - chrono::Duration::hours(1));
        assert!(t3 > t2);
        assert_eq!(store.checkpoint(&owner), Some(t3));
    }

    #[test]
    fn summary_counts() {
        let store = LocalStore::new();
        let notes = store.table::<Note>();
        let owner = OwnerId::new("o");
        let a = notes.insert(&owner, note("a")).unwrap();
        notes.insert(&owner, note("b")).unwrap();
        notes.soft_delete(a.local_key()).unwrap();

        let summary = store.summary();
        assert_eq!(
            summary,
            vec![TableSummary {
                table: "notes".into(),
                total: 2,
                dirty: 2,
                tombstones: 1,
            }]
        );
    }
}
