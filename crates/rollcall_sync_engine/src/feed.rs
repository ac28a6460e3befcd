//! Change-feed listener.

use crate::config::RetryConfig;
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::mapper::{to_local_shape, SyncEntity};
use futures::StreamExt;
use rollcall_store::{GlobalKey, LocalStore, MergePolicy};
use rollcall_sync_protocol::{FeedEvent, FeedEventType, SubscribeRequest};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What applying a feed event did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedApplied {
    /// Remote state was inserted or merged, record clean.
    Merged,
    /// The record was hard-removed.
    Removed,
    /// A newer local edit was kept under the merge policy.
    KeptLocal,
    /// Nothing to do: not ours, or already absent.
    Ignored,
}

/// Applies one feed event to the table of `T` as a single transaction.
///
/// Deletes remove the local record outright, whatever its dirty state:
/// the event reports a removal the remote has already committed.
pub(crate) fn apply_event<T: SyncEntity>(
    store: &LocalStore,
    event: &FeedEvent,
    policy: MergePolicy,
) -> SyncResult<FeedApplied> {
    let table = store.sync_table::<T>();
    match event.event_type {
        FeedEventType::Delete => {
            let key = GlobalKey::from_uuid(event.record.parse_key(T::TABLE)?);
            if table.remove_by_global_key(key)? {
                Ok(FeedApplied::Removed)
            } else {
                Ok(FeedApplied::Ignored)
            }
        }
        FeedEventType::Insert | FeedEventType::Update => {
            let state = to_local_shape::<T>(&event.record)?;
            let report = table.merge_confirmed(vec![state], policy)?;
            if report.kept_local > 0 {
                Ok(FeedApplied::KeptLocal)
            } else {
                Ok(FeedApplied::Merged)
            }
        }
    }
}

/// Holds the session's single feed subscription open, reconnecting with
/// backoff, and applies every event it delivers.
pub(crate) struct FeedListener {
    engine: SyncEngine,
    request: SubscribeRequest,
    retry: RetryConfig,
}

impl FeedListener {
    pub(crate) fn new(engine: SyncEngine) -> Self {
        let ctx = engine.context();
        let request = SubscribeRequest::new(ctx.owner.as_str(), ctx.config.feed_tables.clone());
        let retry = ctx.config.feed_retry.clone();
        Self {
            engine,
            request,
            retry,
        }
    }

    /// Runs until `shutdown` changes or its sender is dropped.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let ctx = self.engine.context();
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }

            let subscribed = tokio::select! {
                result = ctx.call(ctx.remote.subscribe(self.request.clone())) => result,
                _ = shutdown.changed() => return,
            };
            let mut stream = match subscribed {
                Ok(stream) => {
                    info!(owner = %ctx.owner, tables = self.request.tables.len(), "change feed connected");
                    attempt = 0;
                    stream
                }
                Err(err) => {
                    attempt = self.next_attempt(attempt);
                    warn!(error = %err, attempt, "change feed subscribe failed");
                    continue;
                }
            };

            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = shutdown.changed() => return,
                };
                match item {
                    Some(Ok(event)) => self.handle(&event),
                    Some(Err(err)) => warn!(error = %err, "undecodable feed event skipped"),
                    None => break,
                }
            }

            info!("change feed closed, reconnecting");
            attempt = 1;
        }
    }

    fn handle(&self, event: &FeedEvent) {
        match self.engine.apply_feed_event(event) {
            Ok(applied) => debug!(
                table = %event.table,
                global_key = %event.record.global_key,
                ?applied,
                "feed event applied"
            ),
            Err(err) => warn!(
                table = %event.table,
                global_key = %event.record.global_key,
                error = %err,
                "feed event not applied"
            ),
        }
    }

    fn next_attempt(&self, attempt: u32) -> u32 {
        if attempt >= self.retry.max_attempts {
            warn!(
                attempts = attempt,
                "change feed still unreachable, restarting backoff"
            );
            1
        } else {
            attempt + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::to_remote_shape;
    use crate::model::{Session, Term};
    use chrono::NaiveDate;
    use rollcall_store::OwnerId;
    use rollcall_sync_protocol::EntityKind;

    fn session(offering: GlobalKey) -> Session {
        Session::new(offering, NaiveDate::from_ymd_opt(2026, 2, 3).unwrap())
    }

    #[test]
    fn insert_then_update_then_delete() {
        let store = LocalStore::new();
        let owner = OwnerId::new("o");
        let sessions = store.table::<Session>();
        let offering = GlobalKey::new();

        // Build a remote row from a throwaway store.
        let scratch = LocalStore::new();
        let record = scratch.table::<Session>().insert(&owner, session(offering)).unwrap();
        let mut row = to_remote_shape(&record).unwrap();

        let applied = apply_event::<Session>(
            &store,
            &FeedEvent::insert(EntityKind::Session, row.clone()),
            MergePolicy::RemoteWins,
        )
        .unwrap();
        assert_eq!(applied, FeedApplied::Merged);
        let local = sessions.find_by_global_key(record.global_key()).unwrap().unwrap();
        assert!(!local.is_dirty());

        row.fields.insert("topic".into(), "Fractions".into());
        apply_event::<Session>(
            &store,
            &FeedEvent::update(EntityKind::Session, row.clone()),
            MergePolicy::RemoteWins,
        )
        .unwrap();
        let local = sessions.find_by_global_key(record.global_key()).unwrap().unwrap();
        assert_eq!(local.data.topic.as_deref(), Some("Fractions"));

        let applied = apply_event::<Session>(
            &store,
            &FeedEvent::delete(EntityKind::Session, row.clone()),
            MergePolicy::RemoteWins,
        )
        .unwrap();
        assert_eq!(applied, FeedApplied::Removed);
        assert!(sessions.find_by_global_key(record.global_key()).unwrap().is_none());

        let applied = apply_event::<Session>(
            &store,
            &FeedEvent::delete(EntityKind::Session, row),
            MergePolicy::RemoteWins,
        )
        .unwrap();
        assert_eq!(applied, FeedApplied::Ignored);
    }

    #[test]
    fn delete_removes_dirty_record() {
        let store = LocalStore::new();
        let owner = OwnerId::new("o");
        let terms = store.table::<Term>();
        let term = Term {
            name: "Spring".into(),
            starts_on: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2026, 5, 29).unwrap(),
        };
        let record = terms.insert(&owner, term).unwrap();
        assert!(record.is_dirty());

        let row = to_remote_shape(&record).unwrap();
        let applied = apply_event::<Term>(
            &store,
            &FeedEvent::delete(EntityKind::Term, row),
            MergePolicy::LastWriterWins,
        )
        .unwrap();
        assert_eq!(applied, FeedApplied::Removed);
        assert_eq!(terms.count().unwrap(), 0);
    }
}
