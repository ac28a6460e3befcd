//! Push engine: local dirty records to the remote.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::mapper::{to_remote_shape, SyncEntity};
use chrono::Utc;
use rollcall_store::Ack;
use rollcall_sync_protocol::UpsertRequest;
use serde::Serialize;
use tracing::{debug, warn};

/// Result of pushing one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Records accepted remotely and marked clean.
    pub pushed: usize,
    /// Records held back because a foreign key is malformed.
    pub deferred: usize,
    /// Records accepted remotely but edited meanwhile; still dirty.
    pub stale: usize,
}

/// Pushes every dirty record of `T` owned by the engine's owner.
///
/// Valid rows go out as one upsert batch. On success the whole batch is
/// acknowledged in a single local transaction; on failure nothing is
/// marked clean.
pub(crate) async fn push_table<T: SyncEntity>(ctx: &SyncContext) -> SyncResult<PushReport> {
    let table = ctx.store.sync_table::<T>();
    let dirty = table.query_dirty()?;

    let mut report = PushReport::default();
    let mut rows = Vec::with_capacity(dirty.len());
    let mut acks = Vec::with_capacity(dirty.len());
    for record in dirty.iter().filter(|r| r.meta.owner == ctx.owner) {
        match to_remote_shape(record) {
            Ok(row) => {
                rows.push(row);
                acks.push(Ack::from(record));
            }
            Err(SyncError::Reference(err)) => {
                warn!(
                    table = %T::KIND,
                    global_key = %record.global_key(),
                    field = err.field,
                    value = %err.value,
                    "reference not resolved, record left dirty"
                );
                report.deferred += 1;
            }
            Err(err) => return Err(err),
        }
    }

    if rows.is_empty() {
        return Ok(report);
    }

    let batch = rows.len();
    let response = ctx
        .call(ctx.remote.upsert(UpsertRequest::new(T::KIND, rows)))
        .await?;
    if response.accepted != batch {
        return Err(SyncError::rejected(
            T::TABLE,
            format!("accepted {} of {batch} rows", response.accepted),
        ));
    }

    let acked = table.acknowledge(&acks, Utc::now())?;
    report.pushed = acked.cleaned;
    report.stale = acked.stale;
    debug!(
        table = %T::KIND,
        pushed = report.pushed,
        stale = report.stale,
        deferred = report.deferred,
        "table pushed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::{Offering, Term};
    use crate::remote::{Fault, MemoryRemote};
    use chrono::NaiveDate;
    use rollcall_store::{GlobalKey, LocalStore, OwnerId};
    use rollcall_sync_protocol::EntityKind;
    use std::sync::Arc;

    fn context(remote: &MemoryRemote) -> SyncContext {
        SyncContext {
            owner: OwnerId::new("owner-1"),
            store: LocalStore::new(),
            remote: Arc::new(remote.clone()),
            config: SyncConfig::default(),
        }
    }

    fn term(name: &str) -> Term {
        Term {
            name: name.into(),
            starts_on: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2026, 5, 29).unwrap(),
        }
    }

    #[tokio::test]
    async fn pushes_dirty_records_and_marks_clean() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let terms = ctx.store.table::<Term>();
        let a = terms.insert(&ctx.owner, term("Spring")).unwrap();
        terms.insert(&ctx.owner, term("Fall")).unwrap();

        let report = push_table::<Term>(&ctx).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert!(terms.query_dirty().unwrap().is_empty());
        assert_eq!(remote.rows(EntityKind::Term).len(), 2);
        assert!(remote
            .row(EntityKind::Term, &a.global_key().to_string())
            .is_some());

        // Nothing dirty, nothing sent.
        let report = push_table::<Term>(&ctx).await.unwrap();
        assert_eq!(report, PushReport::default());
        assert_eq!(remote.counters().upserts, 1);
    }

    #[tokio::test]
    async fn failure_leaves_everything_dirty() {
        let remote = MemoryRemote::new();
        remote.fail_table(EntityKind::Term, Fault::Network);
        let ctx = context(&remote);
        let terms = ctx.store.table::<Term>();
        terms.insert(&ctx.owner, term("Spring")).unwrap();

        let err = push_table::<Term>(&ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(terms.query_dirty().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_reference_is_deferred() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let terms = ctx.store.table::<Term>();
        let offerings = ctx.store.table::<Offering>();
        let t = terms.insert(&ctx.owner, term("Spring")).unwrap();
        push_table::<Term>(&ctx).await.unwrap();

        let good = offerings
            .insert(&ctx.owner, Offering::new(t.global_key(), "M1", "Algebra"))
            .unwrap();
        let mut broken = Offering::new(GlobalKey::new(), "M2", "Geometry");
        broken.term_id = "pending".into();
        let broken = offerings.insert(&ctx.owner, broken).unwrap();

        let report = push_table::<Offering>(&ctx).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.deferred, 1);
        assert!(!offerings.get(good.local_key()).unwrap().unwrap().is_dirty());
        assert!(offerings.get(broken.local_key()).unwrap().unwrap().is_dirty());
        let remote_rows = remote.rows(EntityKind::Offering);
        assert_eq!(remote_rows.len(), 1);
        assert_eq!(remote_rows[0].global_key, good.global_key().to_string());
    }

    #[tokio::test]
    async fn other_owners_records_stay_local() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let terms = ctx.store.table::<Term>();
        terms.insert(&OwnerId::new("someone-else"), term("Spring")).unwrap();

        let report = push_table::<Term>(&ctx).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(remote.counters().upserts, 0);
        assert_eq!(terms.query_dirty().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_remote_times_out() {
        let remote = MemoryRemote::new();
        remote.set_latency(Some(std::time::Duration::from_secs(60)));
        let mut ctx = context(&remote);
        ctx.config = SyncConfig::new().with_request_timeout(std::time::Duration::from_secs(1));
        ctx.store.table::<Term>().insert(&ctx.owner, term("Spring")).unwrap();

        let err = push_table::<Term>(&ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert_eq!(ctx.store.table::<Term>().query_dirty().unwrap().len(), 1);
    }
}
