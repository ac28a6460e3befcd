//! # Rollcall Store
//!
//! Local store adapter for the Rollcall sync core.
//!
//! This crate provides:
//! - Typed tables keyed by a device-local key and a global key
//! - Dirty tracking applied by a single write hook
//! - Atomic multi-table transactions
//! - Per-owner sync checkpoints
//! - CBOR snapshots for persistence across restarts
//!
//! ## Write paths
//!
//! Application code writes through [`Table`]. Every such write is a local
//! mutation: the record is marked dirty and its `updated_at` moves forward.
//!
//! The sync engine writes through [`SyncTable`], the only handle that can
//! mark records clean or apply remote state verbatim.
//!
//! ## Key Invariants
//!
//! - A global key never changes once assigned
//! - `updated_at` is never earlier than `created_at`
//! - Soft-deleted records stay in the table until removed by global key

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod record;
mod stamp;
mod store;
mod table;
mod transaction;

pub use error::{StoreError, StoreResult};
pub use key::{GlobalKey, LocalKey, OwnerId};
pub use record::{
    ConfirmedState, Entity, MergeOutcome, MergePolicy, Record, RecordMeta, SyncMarker,
};
pub use store::{LocalStore, TableSummary};
pub use table::{Ack, AckReport, Edit, MergeReport, SyncTable, Table};
pub use transaction::Transaction;
