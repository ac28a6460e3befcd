//! Integration tests for the local store.

use proptest::prelude::*;
use rollcall_store::{
    Ack, ConfirmedState, Entity, GlobalKey, LocalStore, MergePolicy, OwnerId, StoreError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Course {
    title: String,
    credits: u32,
}

impl Entity for Course {
    const TABLE: &'static str = "courses";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Room {
    label: String,
}

impl Entity for Room {
    const TABLE: &'static str = "rooms";
}

fn course(title: &str) -> Course {
    Course {
        title: title.into(),
        credits: 3,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Edit(u32),
    Delete,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..10).prop_map(Op::Edit),
        Just(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn local_writes_always_leave_records_dirty(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let store = LocalStore::new();
        let courses = store.table::<Course>();
        let sync = store.sync_table::<Course>();
        let owner = OwnerId::new("owner");

        let inserted = courses.insert(&owner, course("Algebra")).unwrap();
        let acks = [Ack::from(&inserted)];
        sync.acknowledge(&acks, chrono::Utc::now()).unwrap();

        let mut last = inserted.meta.updated_at;
        for op in ops {
            let record = match op {
                Op::Edit(credits) => courses
                    .update(inserted.local_key(), |c| c.credits = credits)
                    .unwrap(),
                Op::Delete => courses.soft_delete(inserted.local_key()).unwrap(),
            };
            prop_assert!(record.is_dirty());
            prop_assert!(record.meta.updated_at > last);
            prop_assert!(record.meta.updated_at >= record.meta.created_at);
            last = record.meta.updated_at;
        }
    }
}

#[test]
fn snapshot_roundtrip_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.cbor");
    let owner = OwnerId::new("instructor-1");

    let store = LocalStore::new();
    let courses = store.table::<Course>();
    let rooms = store.table::<Room>();
    let a = courses.insert(&owner, course("Algebra")).unwrap();
    let b = courses.insert(&owner, course("Biology")).unwrap();
    rooms
        .insert(&owner, Room { label: "B12".into() })
        .unwrap();
    store
        .sync_table::<Course>()
        .acknowledge(&[Ack::from(&a)], chrono::Utc::now())
        .unwrap();
    let checkpoint = store.advance_checkpoint(&owner, chrono::Utc::now());
    store.save_snapshot(&path).unwrap();

    let reopened = LocalStore::open_snapshot(&path).unwrap();
    assert_eq!(reopened.table_names(), vec!["courses", "rooms"]);
    assert_eq!(reopened.checkpoint(&owner), Some(checkpoint));

    let courses = reopened.table::<Course>();
    let a2 = courses.find_by_global_key(a.global_key()).unwrap().unwrap();
    assert!(!a2.is_dirty());
    assert_eq!(a2.data, a.data);
    let b2 = courses.get(b.local_key()).unwrap().unwrap();
    assert!(b2.is_dirty());
    assert_eq!(b2.meta, b.meta);

    // Local keys continue after the highest restored key.
    let c = courses.insert(&owner, course("Chemistry")).unwrap();
    assert_eq!(c.local_key().as_u64(), 3);
}

#[test]
fn opening_missing_snapshot_gives_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open_snapshot(&dir.path().join("absent.cbor")).unwrap();
    assert!(store.table_names().is_empty());
}

#[test]
fn corrupt_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.cbor");
    std::fs::write(&path, b"not cbor at all").unwrap();
    let err = LocalStore::open_snapshot(&path).unwrap_err();
    assert!(matches!(err, StoreError::Codec { .. }));
}

#[test]
fn multi_table_transaction_is_atomic() {
    let store = LocalStore::new();
    let courses = store.table::<Course>();
    let rooms = store.table::<Room>();
    let owner = OwnerId::new("o");

    let result: Result<(), StoreError> = store.transaction(|txn| {
        txn.insert(owner.clone(), course("Algebra"))?;
        txn.insert(owner.clone(), Room { label: "A1".into() })?;
        Err(StoreError::aborted("room double-booked"))
    });
    assert!(result.is_err());
    assert_eq!(courses.count().unwrap(), 0);
    assert_eq!(rooms.count().unwrap(), 0);

    store
        .transaction(|txn| {
            txn.insert(owner.clone(), course("Algebra"))?;
            txn.insert(owner.clone(), Room { label: "A1".into() })?;
            Ok(())
        })
        .unwrap();
    assert_eq!(courses.count().unwrap(), 1);
    assert_eq!(rooms.count().unwrap(), 1);
}

#[test]
fn merge_then_local_edit_marks_dirty_again() {
    let store = LocalStore::new();
    let courses = store.table::<Course>();
    let sync = store.sync_table::<Course>();
    let owner = OwnerId::new("o");
    let key = GlobalKey::new();
    let at = chrono::Utc::now();

    sync.merge_confirmed(
        vec![ConfirmedState {
            global_key: key,
            owner: owner.clone(),
            created_at: at,
            updated_at: at,
            deleted: false,
            data: course("Remote"),
        }],
        MergePolicy::RemoteWins,
    )
    .unwrap();
    assert!(courses.query_dirty().unwrap().is_empty());

    let local = courses.find_by_global_key(key).unwrap().unwrap();
    let edited = courses
        .update(local.local_key(), |c| c.title = "Edited".into())
        .unwrap();
    assert!(edited.is_dirty());
    assert!(edited.meta.updated_at > at);
    assert_eq!(edited.global_key(), key);
    assert_eq!(courses.query_dirty().unwrap().len(), 1);
}

#[test]
fn snapshot_checkpoint_never_ahead_of_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new();
    let owner = OwnerId::new("instructor-1");
    let sync = store.sync_table::<Course>();
    let base = chrono::Utc::now() - chrono::Duration::hours(1);
    let stamp_of = |i: i64| base + chrono::Duration::milliseconds(i);
    const ROWS: i64 = 300;

    let pulling = std::sync::atomic::AtomicBool::new(true);
    let saved = std::thread::scope(|scope| {
        scope.spawn(|| {
            // Merge a row, then move the checkpoint past it, like a pull.
            for i in 0..ROWS {
                let at = stamp_of(i);
                sync.merge_confirmed(
                    vec![ConfirmedState {
                        global_key: GlobalKey::new(),
                        owner: owner.clone(),
                        created_at: at,
                        updated_at: at,
                        deleted: false,
                        data: course("Pulled"),
                    }],
                    MergePolicy::RemoteWins,
                )
                .unwrap();
                store.advance_checkpoint(&owner, at);
            }
            pulling.store(false, std::sync::atomic::Ordering::SeqCst);
        });

        let mut saved = Vec::new();
        while pulling.load(std::sync::atomic::Ordering::SeqCst) {
            let path = dir.path().join(format!("store-{}.cbor", saved.len()));
            store.save_snapshot(&path).unwrap();
            saved.push(path);
        }
        saved
    });

    for path in saved {
        let reopened = LocalStore::open_snapshot(&path).unwrap();
        let Some(checkpoint) = reopened.checkpoint(&owner) else {
            continue;
        };
        let covered = (0..ROWS).filter(|i| stamp_of(*i) <= checkpoint).count();
        let present = reopened
            .table::<Course>()
            .scan_all()
            .unwrap()
            .iter()
            .filter(|r| r.meta.updated_at <= checkpoint)
            .count();
        assert_eq!(present, covered, "{}", path.display());
    }
}
