//! Scheduler and change-feed listener behavior.

use chrono::{NaiveDate, Utc};
use rollcall_store::{GlobalKey, LocalStore, OwnerId};
use rollcall_sync_engine::{
    FeedApplied, MemoryRemote, NetworkState, RetryConfig, SyncConfig, SyncEngine, Term,
};
use rollcall_sync_protocol::{EntityKind, FeedEvent, RemoteRow};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const OWNER: &str = "instructor-7";

fn engine(remote: &MemoryRemote, network: &NetworkState, config: SyncConfig) -> SyncEngine {
    SyncEngine::initialize(
        OwnerId::new(OWNER),
        LocalStore::new(),
        Arc::new(remote.clone()),
        Arc::new(network.clone()),
        config.with_feed_retry(RetryConfig::immediate()),
    )
}

fn term_row(key: GlobalKey, owner: &str) -> RemoteRow {
    let Value::Object(fields) = json!({
        "name": "Autumn 2026",
        "starts_on": "2026-09-01",
        "ends_on": "2026-12-18",
    }) else {
        unreachable!()
    };
    let now = Utc::now();
    RemoteRow {
        global_key: key.to_string(),
        owner_id: owner.into(),
        created_at: now,
        updated_at: now,
        deleted: false,
        fields,
    }
}

fn spring() -> Term {
    Term {
        name: "Spring 2026".into(),
        starts_on: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
        ends_on: NaiveDate::from_ymd_opt(2026, 5, 29).unwrap(),
    }
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn feed_applies_remote_writes_and_reconnects() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote, &NetworkState::default(), SyncConfig::default());
    let terms = engine.store().table::<Term>();
    let handle = engine.start().unwrap();
    assert!(eventually(|| remote.subscriber_count() == 1).await);

    let key = GlobalKey::new();
    remote.write_row(EntityKind::Term, term_row(key, OWNER));
    assert!(eventually(|| terms.find_by_global_key(key).unwrap().is_some()).await);
    let local = terms.find_by_global_key(key).unwrap().unwrap();
    assert!(!local.is_dirty());
    assert_eq!(local.data.name, "Autumn 2026");

    remote.disconnect_feeds();
    assert!(
        eventually(|| remote.counters().subscribes >= 2 && remote.subscriber_count() == 1).await
    );

    assert!(remote.delete_row(EntityKind::Term, &key.to_string()));
    assert!(eventually(|| terms.find_by_global_key(key).unwrap().is_none()).await);
    assert_eq!(engine.stats().feed_events_applied, 2);

    handle.shutdown().await;
    assert!(eventually(|| remote.subscriber_count() == 0).await);
}

#[tokio::test]
async fn feed_events_for_other_owners_are_ignored() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote, &NetworkState::default(), SyncConfig::default());
    let key = GlobalKey::new();

    let event = FeedEvent::insert(EntityKind::Term, term_row(key, "someone-else"));
    assert_eq!(engine.apply_feed_event(&event).unwrap(), FeedApplied::Ignored);
    assert!(engine
        .store()
        .table::<Term>()
        .find_by_global_key(key)
        .unwrap()
        .is_none());

    let event = FeedEvent::delete(EntityKind::Term, term_row(key, OWNER));
    assert_eq!(engine.apply_feed_event(&event).unwrap(), FeedApplied::Ignored);
    assert_eq!(engine.stats().feed_events_applied, 0);
}

#[tokio::test]
async fn network_return_and_requests_trigger_cycles() {
    let remote = MemoryRemote::new();
    let network = NetworkState::new(false);
    let engine = engine(&remote, &network, SyncConfig::default());
    let term = engine
        .store()
        .table::<Term>()
        .insert(engine.owner(), spring())
        .unwrap();

    let handle = engine.start().unwrap();
    // The listener subscribes after the scheduler is already waiting.
    assert!(eventually(|| remote.subscriber_count() == 1).await);

    network.set_online(true);
    assert!(eventually(|| engine.stats().cycles_completed == 1).await);
    assert!(remote
        .row(EntityKind::Term, &term.global_key().to_string())
        .is_some());

    handle.request_sync();
    assert!(eventually(|| engine.stats().cycles_completed == 2).await);

    network.set_online(false);
    handle.request_sync();
    assert!(eventually(|| engine.stats().cycles_offline == 1).await);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interval_triggers_cycles() {
    let remote = MemoryRemote::new();
    let config = SyncConfig::default().with_sync_interval(Duration::from_secs(60));
    let engine = engine(&remote, &NetworkState::default(), config);
    let handle = engine.start().unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(engine.stats().cycles_completed, 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(eventually(|| engine.stats().cycles_completed == 1).await);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(eventually(|| engine.stats().cycles_completed == 2).await);

    handle.shutdown().await;
}
