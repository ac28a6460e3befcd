//! The remote store contract and an in-memory implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use rollcall_sync_protocol::{
    is_well_formed_key, EntityKind, FeedEvent, RemoteRow, SelectQuery, SubscribeRequest,
    UpsertRequest, UpsertResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A live change feed. Ends when the remote closes the subscription.
pub type FeedStream = BoxStream<'static, SyncResult<FeedEvent>>;

/// Authenticated access to the remote relational store.
///
/// Implementations do not retry; the engine decides what to do with a
/// failure.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Inserts or replaces a batch of rows, keyed by global key.
    ///
    /// The batch is applied entirely or not at all.
    async fn upsert(&self, request: UpsertRequest) -> SyncResult<UpsertResponse>;

    /// Returns rows matching the query, oldest update first.
    async fn select(&self, query: SelectQuery) -> SyncResult<Vec<RemoteRow>>;

    /// Opens a change-feed subscription.
    async fn subscribe(&self, request: SubscribeRequest) -> SyncResult<FeedStream>;
}

/// Failure injected into a [`MemoryRemote`] table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Calls fail as if the connection dropped.
    Network,
    /// Calls are refused with the given message.
    Reject(String),
}

/// Number of calls served by a [`MemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCounters {
    /// Upsert calls, including failed ones.
    pub upserts: usize,
    /// Select calls, including failed ones.
    pub selects: usize,
    /// Subscribe calls, including failed ones.
    pub subscribes: usize,
}

struct Subscriber {
    request: SubscribeRequest,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct RemoteState {
    tables: BTreeMap<EntityKind, BTreeMap<String, RemoteRow>>,
    subscribers: Vec<Subscriber>,
    unreachable: bool,
    faults: HashMap<EntityKind, Fault>,
    latency: Option<Duration>,
    counters: RemoteCounters,
}

impl RemoteState {
    fn check(&self, table: Option<EntityKind>) -> SyncResult<()> {
        if self.unreachable {
            return Err(SyncError::network("remote unreachable"));
        }
        match table.and_then(|t| self.faults.get(&t).map(|f| (t, f))) {
            Some((_, Fault::Network)) => Err(SyncError::network("connection reset by peer")),
            Some((table, Fault::Reject(message))) => Err(SyncError::rejected(table.table_name(), message.clone())),
            None => Ok(()),
        }
    }

    fn contains(&self, table: EntityKind, global_key: &str) -> bool {
        self.tables
            .get(&table)
            .is_some_and(|rows| rows.contains_key(global_key))
    }

    /// Enforces primary and foreign key constraints on a batch.
    fn check_constraints(&self, request: &UpsertRequest) -> SyncResult<()> {
        let table = request.table;
        for row in &request.rows {
            if !is_well_formed_key(&row.global_key) {
                return Err(SyncError::rejected(
                    table.table_name(),
                    format!("invalid input syntax for type uuid: {:?}", row.global_key),
                ));
            }
            for (column, target) in table.references() {
                let value = row.text_column(column).unwrap_or_default();
                if !self.contains(*target, value) {
                    return Err(SyncError::rejected(
                        table.table_name(),
                        format!(
                            "insert or update on table \"{table}\" violates foreign key \
                             constraint \"{table}_{column}_fkey\": key {value:?} is not \
                             present in table \"{target}\""
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn publish(&mut self, event: FeedEvent) {
        self.subscribers.retain(|sub| {
            if sub.request.owner_id != event.record.owner_id || !sub.request.watches(event.table) {
                return !sub.sender.is_closed();
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }

    fn write(&mut self, table: EntityKind, row: RemoteRow) {
        let rows = self.tables.entry(table).or_default();
        let event = if rows.contains_key(&row.global_key) {
            FeedEvent::update(table, row.clone())
        } else {
            FeedEvent::insert(table, row.clone())
        };
        rows.insert(row.global_key.clone(), row);
        self.publish(event);
    }
}

/// In-memory remote store.
///
/// Behaves like the relational remote the engine talks to in production:
/// batch-atomic upserts with foreign-key enforcement, owner-filtered
/// selects and a per-owner change feed. Faults, latency and writes from
/// other devices can be injected. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a network error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Makes calls for `table` fail with `fault`.
    pub fn fail_table(&self, table: EntityKind, fault: Fault) {
        self.state.lock().faults.insert(table, fault);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.unreachable = false;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Returns call counters.
    pub fn counters(&self) -> RemoteCounters {
        self.state.lock().counters
    }

    /// Returns every row of `table`.
    pub fn rows(&self, table: EntityKind) -> Vec<RemoteRow> {
        self.state
            .lock()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns one row.
    pub fn row(&self, table: EntityKind, global_key: &str) -> Option<RemoteRow> {
        self.state
            .lock()
            .tables
            .get(&table)
            .and_then(|rows| rows.get(global_key).cloned())
    }

    /// Writes a row as another device would, notifying subscribers.
    pub fn write_row(&self, table: EntityKind, row: RemoteRow) {
        self.state.lock().write(table, row);
    }

    /// Hard-deletes a row, notifying subscribers. Returns false if absent.
    pub fn delete_row(&self, table: EntityKind, global_key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.remove(global_key));
        match removed {
            Some(row) => {
                state.publish(FeedEvent::delete(table, row));
                true
            }
            None => false,
        }
    }

    /// Closes every open feed subscription.
    pub fn disconnect_feeds(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Returns the number of open feed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.sender.is_closed());
        state.subscribers.len()
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn upsert(&self, request: UpsertRequest) -> SyncResult<UpsertResponse> {
        self.delay().await;
        let mut state = self.state.lock();
        state.counters.upserts += 1;
        state.check(Some(request.table))?;
        state.check_constraints(&request)?;

        let accepted = request.rows.len();
        for row in request.rows {
            state.write(request.table, row);
        }
        Ok(UpsertResponse { accepted })
    }

    async fn select(&self, query: SelectQuery) -> SyncResult<Vec<RemoteRow>> {
        self.delay().await;
        let mut state = self.state.lock();
        state.counters.selects += 1;
        state.check(Some(query.table))?;

        let mut rows: Vec<RemoteRow> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.values().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|row| row.updated_at);
        Ok(rows)
    }

    async fn subscribe(&self, request: SubscribeRequest) -> SyncResult<FeedStream> {
        self.delay().await;
        let mut state = self.state.lock();
        state.counters.subscribes += 1;
        state.check(None)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { request, sender });
        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (Ok(event), receiver))
        });
        Ok(Box::pin(stream))
    }
}
