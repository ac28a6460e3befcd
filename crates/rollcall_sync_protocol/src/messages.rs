//! Request and response messages for the remote API.

use crate::kind::EntityKind;
use crate::row::{format_timestamp, RemoteRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch upsert of rows into one table, idempotent on the global key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRequest {
    /// Target table.
    pub table: EntityKind,
    /// Rows to insert or replace.
    pub rows: Vec<RemoteRow>,
}

impl UpsertRequest {
    /// Creates an upsert request.
    pub fn new(table: EntityKind, rows: Vec<RemoteRow>) -> Self {
        Self { table, rows }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column used to resolve conflicts remotely.
    pub const CONFLICT_COLUMN: &'static str = "global_key";
}

/// Remote acknowledgement of an upsert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResponse {
    /// Number of rows written.
    pub accepted: usize,
}

/// Filtered select of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Table to read.
    pub table: EntityKind,
    /// Only rows owned by this account.
    pub owner_id: String,
    /// Only rows updated strictly after this time; everything if absent.
    pub updated_after: Option<DateTime<Utc>>,
}

impl SelectQuery {
    /// Creates a select query.
    pub fn new(
        table: EntityKind,
        owner_id: impl Into<String>,
        updated_after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            table,
            owner_id: owner_id.into(),
            updated_after,
        }
    }

    /// Returns true if `row` satisfies the filter.
    pub fn matches(&self, row: &RemoteRow) -> bool {
        row.owner_id == self.owner_id
            && self
                .updated_after
                .map_or(true, |since| row.updated_at > since)
    }

    /// Renders the filter as PostgREST query parameters, oldest first.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("owner_id", format!("eq.{}", self.owner_id))];
        if let Some(since) = self.updated_after {
            pairs.push(("updated_at", format!("gt.{}", format_timestamp(since))));
        }
        pairs.push(("order", "updated_at.asc".to_string()));
        pairs
    }
}

/// Change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Only events for rows owned by this account.
    pub owner_id: String,
    /// Tables to watch.
    pub tables: Vec<EntityKind>,
}

impl SubscribeRequest {
    /// Creates a subscription request.
    pub fn new(owner_id: impl Into<String>, tables: Vec<EntityKind>) -> Self {
        Self {
            owner_id: owner_id.into(),
            tables,
        }
    }

    /// Returns true if the subscription covers `table`.
    pub fn watches(&self, table: EntityKind) -> bool {
        self.tables.contains(&table)
    }

    /// Renders the subscription as query parameters.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let tables: Vec<&str> = self.tables.iter().map(|t| t.table_name()).collect();
        vec![
            ("owner_id", format!("eq.{}", self.owner_id)),
            ("tables", tables.join(",")),
        ]
    }
}
