//! Pull engine: remote changes into the local store.

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::mapper::{to_local_shape, SyncEntity};
use chrono::{DateTime, Utc};
use rollcall_sync_protocol::SelectQuery;
use serde::Serialize;
use tracing::debug;

/// Result of pulling one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Rows returned by the remote.
    pub fetched: usize,
    /// Rows inserted locally.
    pub inserted: usize,
    /// Local records replaced by remote state.
    pub updated: usize,
    /// Local records newer than the fetched row, left untouched.
    pub kept_local: usize,
}

/// Fetches rows of `T` changed after `since` and merges them.
///
/// All rows are decoded before anything is written, and the merge is one
/// local transaction. The checkpoint is not touched here.
pub(crate) async fn pull_table<T: SyncEntity>(
    ctx: &SyncContext,
    since: Option<DateTime<Utc>>,
) -> SyncResult<PullReport> {
    let query = SelectQuery::new(T::KIND, ctx.owner.as_str(), since);
    let rows = ctx.call(ctx.remote.select(query)).await?;
    if rows.is_empty() {
        return Ok(PullReport::default());
    }

    let states = rows
        .iter()
        .map(to_local_shape::<T>)
        .collect::<SyncResult<Vec<_>>>()?;
    let merged = ctx
        .store
        .sync_table::<T>()
        .merge_confirmed(states, ctx.config.merge_policy)?;

    let report = PullReport {
        fetched: rows.len(),
        inserted: merged.inserted,
        updated: merged.updated,
        kept_local: merged.kept_local,
    };
    debug!(
        table = %T::KIND,
        fetched = report.fetched,
        inserted = report.inserted,
        updated = report.updated,
        "table pulled"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::error::SyncError;
    use crate::model::Person;
    use crate::remote::MemoryRemote;
    use rollcall_store::{LocalStore, MergePolicy, OwnerId};
    use rollcall_sync_protocol::{EntityKind, RemoteRow};
    use serde_json::json;
    use std::sync::Arc;

    const KEY: &str = "9c1d2e3f-4a5b-4c6d-8e7f-0a1b2c3d4e5f";

    fn context(remote: &MemoryRemote) -> SyncContext {
        SyncContext {
            owner: OwnerId::new("owner-1"),
            store: LocalStore::new(),
            remote: Arc::new(remote.clone()),
            config: SyncConfig::default(),
        }
    }

    fn person_row(key: &str, given: &str, updated_at: DateTime<Utc>) -> RemoteRow {
        let fields = json!({"given_name": given, "family_name": "Okafor"});
        RemoteRow {
            global_key: key.into(),
            owner_id: "owner-1".into(),
            created_at: updated_at,
            updated_at,
            deleted: false,
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn inserts_new_rows_clean() {
        let remote = MemoryRemote::new();
        remote.write_row(EntityKind::Person, person_row(KEY, "Ada", Utc::now()));
        let ctx = context(&remote);

        let report = pull_table::<Person>(&ctx, None).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.inserted, 1);

        let people = ctx.store.table::<Person>();
        let all = people.scan_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_dirty());
        assert_eq!(all[0].data.given_name, "Ada");
        assert_eq!(all[0].data.student_number, None);
    }

    #[tokio::test]
    async fn newer_remote_state_replaces_dirty_local() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        remote.write_row(EntityKind::Person, person_row(KEY, "Ada", Utc::now()));
        pull_table::<Person>(&ctx, None).await.unwrap();

        let people = ctx.store.table::<Person>();
        let local = people.scan_all().unwrap().remove(0);
        people
            .update(local.local_key(), |p| p.given_name = "Local".into())
            .unwrap();

        let newer = Utc::now() + chrono::Duration::minutes(5);
        remote.write_row(EntityKind::Person, person_row(KEY, "Remote", newer));
        let report = pull_table::<Person>(&ctx, None).await.unwrap();
        assert_eq!(report.updated, 1);

        let merged = people.get(local.local_key()).unwrap().unwrap();
        assert_eq!(merged.data.given_name, "Remote");
        assert!(!merged.is_dirty());
        assert_eq!(merged.meta.updated_at, newer);
    }

    #[tokio::test]
    async fn refetched_own_row_keeps_later_edit() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let pushed_at = Utc::now() - chrono::Duration::seconds(30);
        remote.write_row(EntityKind::Person, person_row(KEY, "Ada", pushed_at));
        pull_table::<Person>(&ctx, None).await.unwrap();

        // Edited after the push landed; the same cycle re-fetches the pushed row.
        let people = ctx.store.table::<Person>();
        let local = people.scan_all().unwrap().remove(0);
        people
            .update(local.local_key(), |p| p.given_name = "Ada Lovelace".into())
            .unwrap();

        let since = pushed_at - chrono::Duration::seconds(1);
        let report = pull_table::<Person>(&ctx, Some(since)).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.kept_local, 1);
        assert_eq!(report.updated, 0);

        let kept = people.get(local.local_key()).unwrap().unwrap();
        assert_eq!(kept.data.given_name, "Ada Lovelace");
        assert!(kept.is_dirty());
        assert_eq!(people.query_dirty().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn last_writer_wins_skips_stale_rows_over_clean_local() {
        let remote = MemoryRemote::new();
        let mut ctx = context(&remote);
        ctx.config = SyncConfig::new().with_merge_policy(MergePolicy::LastWriterWins);
        let at = Utc::now();
        remote.write_row(EntityKind::Person, person_row(KEY, "Ada", at));
        pull_table::<Person>(&ctx, None).await.unwrap();

        let older = at - chrono::Duration::hours(1);
        remote.write_row(EntityKind::Person, person_row(KEY, "Stale", older));
        let report = pull_table::<Person>(&ctx, None).await.unwrap();
        assert_eq!(report.kept_local, 1);

        let people = ctx.store.table::<Person>();
        let kept = people.scan_all().unwrap().remove(0);
        assert_eq!(kept.data.given_name, "Ada");
        assert!(!kept.is_dirty());
    }

    #[tokio::test]
    async fn since_filters_old_rows() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let at = Utc::now();
        remote.write_row(EntityKind::Person, person_row(KEY, "Ada", at));

        let report = pull_table::<Person>(&ctx, Some(at)).await.unwrap();
        assert_eq!(report, PullReport::default());
        assert_eq!(ctx.store.table::<Person>().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_row_fails_the_table() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote);
        let mut row = person_row(KEY, "Ada", Utc::now());
        row.fields.remove("family_name");
        remote.write_row(
            EntityKind::Person,
            person_row("0d6f0a2c-1b8e-4c55-8f0e-7b9b2d1a4c33", "Bo", Utc::now()),
        );
        remote.write_row(EntityKind::Person, row);

        let err = pull_table::<Person>(&ctx, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(ctx.store.table::<Person>().count().unwrap(), 0);
    }
}
