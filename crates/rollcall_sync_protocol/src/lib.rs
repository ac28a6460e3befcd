//! # Rollcall Sync Protocol
//!
//! Remote wire shapes for the Rollcall sync core.
//!
//! This crate provides:
//! - `EntityKind`, the catalogue of synchronized tables and their push order
//! - `RemoteRow`, the envelope every remote row is carried in
//! - Upsert, select and subscribe messages
//! - Change-feed events
//! - Global key format validation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod error;
mod kind;
mod messages;
mod row;

pub use change_feed::{FeedEvent, FeedEventType};
pub use error::{ProtocolError, ProtocolResult};
pub use kind::EntityKind;
pub use messages::{SelectQuery, SubscribeRequest, UpsertRequest, UpsertResponse};
pub use row::{format_timestamp, is_well_formed_key, RemoteRow};
