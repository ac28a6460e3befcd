//! Translation between local records and remote rows.
//!
//! [`to_remote_shape`] is the only way a record becomes a push payload,
//! and it refuses to produce one while any foreign key is malformed.

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::feed::{self, FeedApplied};
use crate::pull::{self, PullReport};
use crate::push::{self, PushReport};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rollcall_store::{
    ConfirmedState, Entity, GlobalKey, LocalStore, MergePolicy, OwnerId, Record,
};
use rollcall_sync_protocol::{is_well_formed_key, EntityKind, FeedEvent, ProtocolError, RemoteRow};
use serde_json::Value;
use thiserror::Error;

/// A synchronized entity.
pub trait SyncEntity: Entity {
    /// Remote table this entity maps to.
    const KIND: EntityKind;
    /// Fields holding the global key of another record.
    const FOREIGN_KEYS: &'static [&'static str];

    /// Returns the value of the foreign-key field `field`.
    fn foreign_key_value(&self, field: &str) -> Option<&str>;
}

/// A record refers to another by something other than a well-formed
/// global key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{table} record {global_key}: {field} holds malformed global key {value:?}")]
pub struct ReferenceError {
    /// Table of the referring record.
    pub table: EntityKind,
    /// Global key of the referring record.
    pub global_key: GlobalKey,
    /// Foreign-key field.
    pub field: &'static str,
    /// Value found in the field.
    pub value: String,
}

/// Maps a local record to its remote row.
///
/// Returns [`SyncError::Reference`](crate::SyncError::Reference) if any foreign key is missing or not
/// a well-formed global key. No partial row is ever produced.
pub fn to_remote_shape<T: SyncEntity>(record: &Record<T>) -> SyncResult<RemoteRow> {
    for &field in T::FOREIGN_KEYS {
        let value = record.data.foreign_key_value(field).unwrap_or_default();
        if !is_well_formed_key(value) {
            return Err(ReferenceError {
                table: T::KIND,
                global_key: record.global_key(),
                field,
                value: value.to_string(),
            }
            .into());
        }
    }

    let fields = match serde_json::to_value(&record.data).map_err(ProtocolError::from)? {
        Value::Object(fields) => fields,
        _ => {
            return Err(
                ProtocolError::invalid_row(T::TABLE, "entity is not a JSON object").into(),
            )
        }
    };

    Ok(RemoteRow {
        global_key: record.global_key().to_string(),
        owner_id: record.meta.owner.as_str().to_string(),
        created_at: record.meta.created_at,
        updated_at: record.meta.updated_at,
        deleted: record.meta.deleted,
        fields,
    })
}

/// Maps a remote row to the state it confirms for the local record.
pub fn to_local_shape<T: SyncEntity>(row: &RemoteRow) -> SyncResult<ConfirmedState<T>> {
    let global_key = GlobalKey::from_uuid(row.parse_key(T::TABLE)?);
    let data: T = serde_json::from_value(Value::Object(row.fields.clone()))
        .map_err(|e| ProtocolError::invalid_row(T::TABLE, e.to_string()))?;
    Ok(ConfirmedState {
        global_key,
        owner: OwnerId::new(row.owner_id.clone()),
        created_at: row.created_at,
        updated_at: row.updated_at,
        deleted: row.deleted,
        data,
    })
}

type PushFn = for<'a> fn(&'a SyncContext) -> BoxFuture<'a, SyncResult<PushReport>>;
type PullFn =
    for<'a> fn(&'a SyncContext, Option<DateTime<Utc>>) -> BoxFuture<'a, SyncResult<PullReport>>;
type ApplyFn = fn(&LocalStore, &FeedEvent, MergePolicy) -> SyncResult<FeedApplied>;

/// Everything the generic push, pull and feed routines need to know
/// about one table.
#[derive(Clone, Copy)]
pub struct TableDescriptor {
    /// Table kind.
    pub kind: EntityKind,
    /// Foreign-key fields validated before push.
    pub foreign_keys: &'static [&'static str],
    register: fn(&LocalStore),
    push: PushFn,
    pull: PullFn,
    apply: ApplyFn,
}

impl TableDescriptor {
    /// Builds the descriptor for `T`.
    pub fn of<T: SyncEntity>() -> Self {
        Self {
            kind: T::KIND,
            foreign_keys: T::FOREIGN_KEYS,
            register: LocalStore::register::<T>,
            push: push_erased::<T>,
            pull: pull_erased::<T>,
            apply: feed::apply_event::<T>,
        }
    }

    /// Returns the descriptor for `kind`.
    pub fn for_kind(kind: EntityKind) -> Self {
        use crate::model::{Enrollment, Mark, Offering, Person, Session, Term};
        match kind {
            EntityKind::Term => Self::of::<Term>(),
            EntityKind::Person => Self::of::<Person>(),
            EntityKind::Offering => Self::of::<Offering>(),
            EntityKind::Enrollment => Self::of::<Enrollment>(),
            EntityKind::Session => Self::of::<Session>(),
            EntityKind::Mark => Self::of::<Mark>(),
        }
    }

    /// Returns every descriptor in push order.
    pub fn all() -> impl Iterator<Item = TableDescriptor> {
        EntityKind::PUSH_ORDER.into_iter().map(Self::for_kind)
    }

    pub(crate) fn register(&self, store: &LocalStore) {
        (self.register)(store);
    }

    pub(crate) fn push<'a>(&self, ctx: &'a SyncContext) -> BoxFuture<'a, SyncResult<PushReport>> {
        (self.push)(ctx)
    }

    pub(crate) fn pull<'a>(
        &self,
        ctx: &'a SyncContext,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, SyncResult<PullReport>> {
        (self.pull)(ctx, since)
    }

    pub(crate) fn apply(
        &self,
        store: &LocalStore,
        event: &FeedEvent,
        policy: MergePolicy,
    ) -> SyncResult<FeedApplied> {
        (self.apply)(store, event, policy)
    }
}

impl std::fmt::Debug for TableDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("kind", &self.kind)
            .field("foreign_keys", &self.foreign_keys)
            .finish_non_exhaustive()
    }
}

fn push_erased<T: SyncEntity>(ctx: &SyncContext) -> BoxFuture<'_, SyncResult<PushReport>> {
    Box::pin(push::push_table::<T>(ctx))
}

fn pull_erased<T: SyncEntity>(
    ctx: &SyncContext,
    since: Option<DateTime<Utc>>,
) -> BoxFuture<'_, SyncResult<PullReport>> {
    Box::pin(pull::pull_table::<T>(ctx, since))
}
