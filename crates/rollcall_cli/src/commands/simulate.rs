//! Simulate command implementation.

use chrono::Utc;
use rollcall_store::{LocalStore, OwnerId, TableSummary};
use rollcall_sync_engine::{
    CycleOutcome, Enrollment, Fault, Mark, MarkStatus, MemoryRemote, NetworkState, Offering,
    Person, Session, SyncConfig, SyncEngine, Term,
};
use rollcall_sync_protocol::EntityKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct Options {
    /// Owner to seed and sync for.
    pub owner: String,
    /// Whether the network is reported unreachable.
    pub offline: bool,
    /// Table whose remote calls fail with a network error.
    pub fail_table: Option<String>,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Owner the cycle ran for.
    pub owner: String,
    /// Outcome of the cycle.
    pub outcome: CycleOutcome,
    /// Local table state after the cycle.
    pub tables: Vec<TableSummary>,
    /// Rows held by the remote after the cycle, per table.
    pub remote_rows: BTreeMap<EntityKind, usize>,
}

/// Runs the simulate command.
pub async fn run(
    path: Option<&Path>,
    options: Options,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = simulate(path, options).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Seeds one record of each kind and runs a single sync cycle.
///
/// When `path` is given, the store is loaded from and saved back to that
/// snapshot, so records left dirty carry over to the next run.
pub async fn simulate(
    path: Option<&Path>,
    options: Options,
) -> Result<SimulateResult, Box<dyn std::error::Error>> {
    let store = match path {
        Some(path) => LocalStore::open_snapshot(path)?,
        None => LocalStore::new(),
    };
    let remote = MemoryRemote::new();
    if let Some(table) = &options.fail_table {
        remote.fail_table(table.parse()?, Fault::Network);
    }

    let owner = OwnerId::new(options.owner);
    let engine = SyncEngine::initialize(
        owner.clone(),
        store.clone(),
        Arc::new(remote.clone()),
        Arc::new(NetworkState::new(!options.offline)),
        SyncConfig::default(),
    );

    seed(&store, &owner)?;
    let outcome = engine.run_sync_cycle().await;

    if let Some(path) = path {
        store.save_snapshot(path)?;
        info!(path = %path.display(), "snapshot saved");
    }

    let remote_rows = EntityKind::PUSH_ORDER
        .into_iter()
        .map(|kind| (kind, remote.rows(kind).len()))
        .collect();
    Ok(SimulateResult {
        owner: owner.to_string(),
        outcome,
        tables: store.summary(),
        remote_rows,
    })
}

fn seed(store: &LocalStore, owner: &OwnerId) -> Result<(), Box<dyn std::error::Error>> {
    let today = Utc::now().date_naive();

    let term = store.table::<Term>().insert(
        owner,
        Term {
            name: "Current term".into(),
            starts_on: today,
            ends_on: today + chrono::Duration::weeks(16),
        },
    )?;
    let person = store.table::<Person>().insert(
        owner,
        Person {
            given_name: "Ada".into(),
            family_name: "Lovelace".into(),
            student_number: Some("S-1815".into()),
        },
    )?;
    let offering = store.table::<Offering>().insert(
        owner,
        Offering::new(term.global_key(), "MATH-101", "Algebra"),
    )?;
    store
        .table::<Enrollment>()
        .insert(owner, Enrollment::new(person.global_key(), offering.global_key()))?;
    let session = store
        .table::<Session>()
        .insert(owner, Session::new(offering.global_key(), today))?;
    store.table::<Mark>().insert(
        owner,
        Mark::new(session.global_key(), person.global_key(), MarkStatus::Present),
    )?;
    Ok(())
}

fn print_text_output(result: &SimulateResult) {
    let outcome = &result.outcome;
    let status = serde_json::to_value(outcome.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    println!("Sync Cycle");
    println!("==========");
    println!("Owner:       {}", result.owner);
    println!("Status:      {status}");
    if let Some(detail) = &outcome.detail {
        println!("Detail:      {detail}");
    }
    if let Some(kind) = outcome.error_kind {
        println!("Error kind:  {kind:?}");
    }
    if let Some(checkpoint) = outcome.report.checkpoint {
        println!("Checkpoint:  {checkpoint}");
    }
    println!();

    println!("Tables");
    println!("------");
    println!(
        "{:<12} {:>7} {:>9} {:>7} {:>7} {:>7}",
        "table", "pushed", "deferred", "pulled", "dirty", "remote"
    );
    for kind in EntityKind::PUSH_ORDER {
        let pushed = outcome.report.pushed.get(&kind);
        let pulled = outcome.report.pulled.get(&kind);
        let dirty = result
            .tables
            .iter()
            .find(|t| t.table == kind.table_name())
            .map_or(0, |t| t.dirty);
        println!(
            "{:<12} {:>7} {:>9} {:>7} {:>7} {:>7}",
            kind.table_name(),
            pushed.map_or(0, |p| p.pushed),
            pushed.map_or(0, |p| p.deferred),
            pulled.map_or(0, |p| p.inserted + p.updated),
            dirty,
            result.remote_rows.get(&kind).copied().unwrap_or(0),
        );
    }

    if !outcome.report.failures.is_empty() {
        println!();
        println!("Failures");
        println!("--------");
        for failure in &outcome.report.failures {
            println!(
                "{} ({}): {}",
                failure.table, failure.phase, failure.message
            );
        }
    }
}
