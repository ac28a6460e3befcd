//! Sync orchestrator.

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::feed::{FeedApplied, FeedListener};
use crate::mapper::TableDescriptor;
use crate::network::NetworkMonitor;
use crate::pull::PullReport;
use crate::push::PushReport;
use crate::remote::RemoteApi;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use rollcall_store::{LocalStore, OwnerId};
use rollcall_sync_protocol::{EntityKind, FeedEvent};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Whether a sync cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No cycle in flight.
    Idle,
    /// A cycle is in flight.
    Syncing,
}

/// What asked for a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The network came back.
    NetworkOnline,
    /// The periodic timer fired.
    Interval,
    /// The caller asked.
    Requested,
}

/// How a sync cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Both phases succeeded.
    Synced,
    /// The network was unreachable; nothing was attempted.
    Offline,
    /// A phase failed; see the detail.
    Error,
    /// Another cycle was already in flight; the trigger was dropped.
    Skipped,
}

/// A table that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    /// The table.
    pub table: EntityKind,
    /// `push` or `pull`.
    pub phase: &'static str,
    /// Error class.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

impl TableFailure {
    fn new(table: EntityKind, phase: &'static str, err: &SyncError) -> Self {
        Self {
            table,
            phase,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-table detail of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Push results of the tables that pushed.
    pub pushed: BTreeMap<EntityKind, PushReport>,
    /// Pull results of the tables that pulled.
    pub pulled: BTreeMap<EntityKind, PullReport>,
    /// Tables that failed.
    pub failures: Vec<TableFailure>,
    /// New checkpoint, if the pull phase completed.
    pub checkpoint: Option<DateTime<Utc>>,
}

impl CycleReport {
    /// Records marked clean after pushing.
    pub fn records_pushed(&self) -> usize {
        self.pushed.values().map(|r| r.pushed).sum()
    }

    /// Rows merged locally.
    pub fn records_pulled(&self) -> usize {
        self.pulled.values().map(|r| r.inserted + r.updated).sum()
    }

    /// Records held back by unresolved references.
    pub fn references_deferred(&self) -> usize {
        self.pushed.values().map(|r| r.deferred).sum()
    }
}

/// Result of one call to [`SyncEngine::trigger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    /// How the cycle ended.
    pub status: CycleStatus,
    /// Error or reason, when not synced.
    pub detail: Option<String>,
    /// Class of the error that ended the cycle.
    pub error_kind: Option<ErrorKind>,
    /// Per-table detail.
    pub report: CycleReport,
    /// When the cycle ended.
    pub finished_at: DateTime<Utc>,
}

impl CycleOutcome {
    fn new(status: CycleStatus, detail: Option<String>, report: CycleReport) -> Self {
        Self {
            status,
            detail,
            error_kind: None,
            report,
            finished_at: Utc::now(),
        }
    }

    fn failed(err: &SyncError, report: CycleReport) -> Self {
        Self {
            error_kind: Some(err.kind()),
            ..Self::new(CycleStatus::Error, Some(err.to_string()), report)
        }
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Cycles that synced.
    pub cycles_completed: u64,
    /// Cycles that ended in error.
    pub cycles_failed: u64,
    /// Triggers dropped because a cycle was in flight.
    pub cycles_skipped: u64,
    /// Triggers that found the network unreachable.
    pub cycles_offline: u64,
    /// Records pushed and marked clean.
    pub records_pushed: u64,
    /// Remote rows merged by pulls.
    pub records_pulled: u64,
    /// Records deferred for unresolved references.
    pub references_deferred: u64,
    /// Feed events that changed the local store.
    pub feed_events_applied: u64,
    /// End of the last successful cycle.
    pub last_sync: Option<DateTime<Utc>>,
    /// Last cycle error.
    pub last_error: Option<String>,
}

struct EngineInner {
    ctx: SyncContext,
    network: Arc<dyn NetworkMonitor>,
    busy: AtomicBool,
    status: watch::Sender<SyncStatus>,
    last_outcome: Mutex<Option<CycleOutcome>>,
    stats: Mutex<SyncStats>,
    wake: Notify,
    started: AtomicBool,
}

/// Marks the engine busy for as long as it lives.
struct BusyGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> BusyGuard<'a> {
    fn acquire(inner: &'a EngineInner) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        inner.status.send_replace(SyncStatus::Syncing);
        Some(Self { inner })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.status.send_replace(SyncStatus::Idle);
        self.inner.busy.store(false, Ordering::Release);
    }
}

/// The sync engine for one owner's session.
///
/// Cloning is cheap and every clone drives the same engine. At most one
/// cycle runs at a time: a trigger that arrives while a cycle is in
/// flight returns [`CycleStatus::Skipped`] without queueing anything.
///
/// # Example
///
/// ```rust,ignore
/// let engine = SyncEngine::initialize(owner, store, remote, network, SyncConfig::default());
/// let outcome = engine.run_sync_cycle().await;
/// assert_eq!(outcome.status, CycleStatus::Synced);
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Creates the engine for `owner`, registering every synchronized
    /// table in `store`.
    pub fn initialize(
        owner: OwnerId,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        network: Arc<dyn NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        for table in TableDescriptor::all() {
            table.register(&store);
        }
        info!(owner = %owner, "sync engine initialized");

        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            inner: Arc::new(EngineInner {
                ctx: SyncContext {
                    owner,
                    store,
                    remote,
                    config,
                },
                network,
                busy: AtomicBool::new(false),
                status,
                last_outcome: Mutex::new(None),
                stats: Mutex::new(SyncStats::default()),
                wake: Notify::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the owner this engine syncs for.
    pub fn owner(&self) -> &OwnerId {
        &self.inner.ctx.owner
    }

    /// Returns the local store.
    pub fn store(&self) -> &LocalStore {
        &self.inner.ctx.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.ctx.config
    }

    pub(crate) fn context(&self) -> &SyncContext {
        &self.inner.ctx
    }

    /// Returns whether a cycle is in flight.
    pub fn sync_status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    /// Returns a receiver observing status changes.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Returns the outcome of the last cycle that ran or found the
    /// network unreachable.
    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.inner.last_outcome.lock().clone()
    }

    /// Returns accumulated statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().clone()
    }

    /// Returns the last successful pull time.
    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.inner.ctx.store.checkpoint(&self.inner.ctx.owner)
    }

    /// Runs one sync cycle at the caller's request.
    pub async fn run_sync_cycle(&self) -> CycleOutcome {
        self.trigger(Trigger::Requested).await
    }

    /// Asks the background scheduler for a cycle. No-op unless started.
    pub fn request_sync(&self) {
        self.inner.wake.notify_one();
    }

    /// Runs one sync cycle for `trigger`.
    ///
    /// Never panics and never returns an error: every failure, including
    /// a panic inside a phase, is reported in the outcome.
    pub async fn trigger(&self, trigger: Trigger) -> CycleOutcome {
        if !self.inner.network.is_online() {
            debug!(?trigger, "network unreachable, sync cycle not started");
            let outcome = CycleOutcome::new(
                CycleStatus::Offline,
                Some("network unreachable".into()),
                CycleReport::default(),
            );
            self.inner.stats.lock().cycles_offline += 1;
            *self.inner.last_outcome.lock() = Some(outcome.clone());
            return outcome;
        }

        let Some(_busy) = BusyGuard::acquire(&self.inner) else {
            debug!(?trigger, "sync cycle in flight, trigger dropped");
            self.inner.stats.lock().cycles_skipped += 1;
            return CycleOutcome::new(
                CycleStatus::Skipped,
                Some("sync cycle already in flight".into()),
                CycleReport::default(),
            );
        };

        info!(?trigger, owner = %self.owner(), "sync cycle started");
        let mut report = CycleReport::default();
        let result = AssertUnwindSafe(self.run_phases(&mut report))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => CycleOutcome::new(CycleStatus::Synced, None, report),
            Ok(Err(err)) => {
                error!(error = %err, kind = ?err.kind(), "sync cycle failed");
                CycleOutcome::failed(&err, report)
            }
            Err(panic) => {
                let err = SyncError::Panicked(panic_message(panic.as_ref()));
                error!(error = %err, "sync cycle panicked");
                CycleOutcome::failed(&err, report)
            }
        };
        self.record(&outcome);
        outcome
    }

    async fn run_phases(&self, report: &mut CycleReport) -> SyncResult<()> {
        let ctx = &self.inner.ctx;

        for table in TableDescriptor::all() {
            match table.push(ctx).await {
                Ok(pushed) => {
                    report.pushed.insert(table.kind, pushed);
                }
                Err(err @ SyncError::LocalStore(_)) => return Err(err),
                Err(err) => {
                    warn!(table = %table.kind, error = %err, "push failed, records left dirty");
                    report.failures.push(TableFailure::new(table.kind, "push", &err));
                }
            }
        }
        if !report.failures.is_empty() {
            return Err(phase_failed("push", &report.failures));
        }

        let since = ctx.store.checkpoint(&ctx.owner);
        let started = Utc::now();
        for table in TableDescriptor::all() {
            match table.pull(ctx, since).await {
                Ok(pulled) => {
                    report.pulled.insert(table.kind, pulled);
                }
                Err(err @ SyncError::LocalStore(_)) => return Err(err),
                Err(err) => {
                    warn!(table = %table.kind, error = %err, "pull failed");
                    report.failures.push(TableFailure::new(table.kind, "pull", &err));
                }
            }
        }
        if !report.failures.is_empty() {
            return Err(phase_failed("pull", &report.failures));
        }

        let checkpoint = ctx.store.advance_checkpoint(&ctx.owner, started);
        debug!(checkpoint = %checkpoint, "checkpoint advanced");
        report.checkpoint = Some(checkpoint);
        Ok(())
    }

    fn record(&self, outcome: &CycleOutcome) {
        let report = &outcome.report;
        let mut stats = self.inner.stats.lock();
        stats.records_pushed += report.records_pushed() as u64;
        stats.records_pulled += report.records_pulled() as u64;
        stats.references_deferred += report.references_deferred() as u64;
        match outcome.status {
            CycleStatus::Synced => {
                stats.cycles_completed += 1;
                stats.last_sync = Some(outcome.finished_at);
                info!(
                    pushed = report.records_pushed(),
                    pulled = report.records_pulled(),
                    deferred = report.references_deferred(),
                    "sync cycle completed"
                );
            }
            CycleStatus::Error => {
                stats.cycles_failed += 1;
                stats.last_error = outcome.detail.clone();
            }
            CycleStatus::Offline | CycleStatus::Skipped => {}
        }
        drop(stats);
        *self.inner.last_outcome.lock() = Some(outcome.clone());
    }

    /// Applies one change-feed event to the local store.
    ///
    /// Events for other owners are ignored. The event is applied as one
    /// store transaction on its table, so it serializes with cycle
    /// writes and local edits to that table.
    pub fn apply_feed_event(&self, event: &FeedEvent) -> SyncResult<FeedApplied> {
        let ctx = &self.inner.ctx;
        if event.record.owner_id != ctx.owner.as_str() {
            debug!(table = %event.table, "feed event for another owner ignored");
            return Ok(FeedApplied::Ignored);
        }

        let applied = TableDescriptor::for_kind(event.table).apply(
            &ctx.store,
            event,
            ctx.config.merge_policy,
        )?;
        if matches!(applied, FeedApplied::Merged | FeedApplied::Removed) {
            self.inner.stats.lock().feed_events_applied += 1;
        }
        Ok(applied)
    }

    /// Starts the scheduler and the change-feed listener.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`SyncError::AlreadyStarted`] while a previous handle is live.
    pub fn start(&self) -> SyncResult<BackgroundHandle> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(self.clone().schedule(shutdown_rx.clone()))];
        if !self.config().feed_tables.is_empty() {
            tasks.push(tokio::spawn(FeedListener::new(self.clone()).run(shutdown_rx)));
        }
        info!(owner = %self.owner(), "sync engine started");
        Ok(BackgroundHandle {
            engine: self.clone(),
            shutdown,
            tasks,
        })
    }

    async fn schedule(self, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.inner.network.subscribe();
        let mut was_online = *online.borrow_and_update();
        let mut watching = true;
        let mut ticker = self.config().sync_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut cycles = JoinSet::new();

        loop {
            let trigger = tokio::select! {
                _ = shutdown.changed() => break,
                () = self.inner.wake.notified() => Trigger::Requested,
                changed = online.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let now_online = *online.borrow_and_update();
                    let came_online = now_online && !was_online;
                    was_online = now_online;
                    if !came_online {
                        continue;
                    }
                    Trigger::NetworkOnline
                }
                () = next_tick(&mut ticker) => Trigger::Interval,
                Some(_) = cycles.join_next(), if !cycles.is_empty() => continue,
            };

            // Cycles run detached so that a trigger arriving mid-cycle
            // reaches the busy guard and is dropped there.
            let engine = self.clone();
            cycles.spawn(async move {
                engine.trigger(trigger).await;
            });
        }

        // In-flight cycles run to completion.
        while cycles.join_next().await.is_some() {}
    }
}

/// Handle to the background tasks started by [`SyncEngine::start`].
///
/// Dropping the handle also stops the tasks, without waiting for them.
pub struct BackgroundHandle {
    engine: SyncEngine,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Asks the scheduler for a cycle.
    pub fn request_sync(&self) {
        self.engine.request_sync();
    }

    /// Stops the scheduler and the feed listener, waiting for an
    /// in-flight cycle to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "background task failed");
            }
        }
        self.engine.inner.started.store(false, Ordering::Release);
        info!(owner = %self.engine.owner(), "sync engine stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn phase_failed(phase: &'static str, failures: &[TableFailure]) -> SyncError {
    let summary = failures
        .iter()
        .map(|f| format!("{}: {}", f.table, f.message))
        .collect::<Vec<_>>()
        .join("; ");
    SyncError::PhaseFailed { phase, summary }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
