//! # Rollcall Sync Engine
//!
//! Offline-first synchronization between a [`rollcall_store::LocalStore`]
//! and a remote relational store.
//!
//! This crate provides:
//! - The synchronized entities (terms, people, offerings, enrollments,
//!   sessions, marks) and their local/remote mapping
//! - Foreign-key validation before anything is sent
//! - Push and pull engines with an incremental pull checkpoint
//! - A change-feed listener with reconnect and backoff
//! - The sync orchestrator with network and interval triggers
//! - An HTTP transport for PostgREST-style remotes
//!
//! ## Architecture
//!
//! A sync cycle runs **push-then-pull**:
//! 1. Push dirty records table by table, parents before children
//! 2. Pull rows changed since the checkpoint and merge them
//! 3. Advance the checkpoint only if every table pulled
//!
//! Between cycles, change-feed events are merged as they arrive.
//!
//! ## Key Invariants
//!
//! - At most one cycle is in flight per engine
//! - A record is only marked clean for the exact state the remote accepted
//! - A record referencing an unknown parent is never sent
//! - The checkpoint never moves backwards

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod engine;
mod error;
mod feed;
mod http;
mod mapper;
mod model;
mod network;
mod pull;
mod push;
mod remote;

pub use config::{RetryConfig, SyncConfig};
pub use engine::{
    BackgroundHandle, CycleOutcome, CycleReport, CycleStatus, SyncEngine, SyncStats, SyncStatus,
    TableFailure, Trigger,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use feed::FeedApplied;
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{
    ndjson_lines, HttpClient, HttpRequest, HttpResponse, HttpStream, HttpTransport, LineStream,
    Method,
};
pub use mapper::{to_local_shape, to_remote_shape, ReferenceError, SyncEntity, TableDescriptor};
pub use model::{Enrollment, Mark, MarkStatus, Offering, Person, Session, Term};
pub use network::{NetworkMonitor, NetworkState};
pub use pull::PullReport;
pub use push::PushReport;
pub use remote::{Fault, FeedStream, MemoryRemote, RemoteApi, RemoteCounters};
