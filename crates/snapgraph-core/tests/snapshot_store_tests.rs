#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use snapgraph_core::core_types::SessionId;
use snapgraph_core::model::{row, ObjectId, Value};
use snapgraph_core::snapshot::{SnapshotChanges, SnapshotStore, SnapshotUpdate};

fn artist(n: i64) -> ObjectId {
    ObjectId::single("Artist", "ARTIST_ID", Value::Int(n))
}

fn name_row(n: i64, name: &str) -> snapgraph_core::Row {
    row([("ARTIST_ID", Value::Int(n)), ("ARTIST_NAME", Value::from(name))])
}

#[test]
fn test_concurrent_puts_of_unrelated_identities_all_land() {
    // GIVEN one store shared by eight writer threads
    let store = Arc::new(SnapshotStore::new("shared", 100_000, None));

    // WHEN each thread writes its own range of identities
    let workers: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..500 {
                    let n = t * 1_000 + i;
                    store.put(artist(n), name_row(n, "x"));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // THEN every write is visible
    assert_eq!(store.len(), 8 * 500);
    assert!(store.get(&artist(7_499)).is_some());
}

#[test]
fn test_concurrent_puts_of_one_identity_keep_a_written_value() {
    let store = Arc::new(SnapshotStore::new("shared", 1_000, None));
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..200 {
                    store.put(artist(1), name_row(1, &format!("w{}-{}", t, i)));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let snapshot = store.get(&artist(1)).unwrap();
    let name = snapshot.get("ARTIST_NAME").and_then(Value::as_str).unwrap();
    assert!(name.ends_with("-199"), "last write of some writer wins, got {}", name);
}

#[test]
fn test_put_notifies_subscribers_with_previous_value() {
    // GIVEN a subscribed session and a cached snapshot
    let store = SnapshotStore::new("shared", 100, None);
    let session = SessionId::new();
    let inbox = store.subscribe(&session);
    store.put(artist(1), name_row(1, "a"));

    // WHEN the snapshot is replaced
    store.put(artist(1), name_row(1, "b"));

    // THEN one event carries before and after
    let event = inbox.try_recv().unwrap();
    assert_eq!(event.modified.len(), 1);
    let change = &event.modified[0];
    assert_eq!(
        change.before.as_ref().and_then(|s| s.get("ARTIST_NAME")),
        Some(&Value::from("a"))
    );
    assert_eq!(change.after.get("ARTIST_NAME"), Some(&Value::from("b")));
    assert!(inbox.try_recv().is_err());
}

#[test]
fn test_forget_does_not_notify() {
    let store = SnapshotStore::new("shared", 100, None);
    let inbox = store.subscribe(&SessionId::new());
    store.put(artist(1), name_row(1, "a"));

    assert!(store.forget(&artist(1)).is_some());

    assert!(store.get(&artist(1)).is_none());
    assert!(inbox.try_recv().is_err());
}

#[test]
fn test_process_changes_skips_the_posting_session() {
    // GIVEN two subscribed sessions
    let store = SnapshotStore::new("shared", 100, None);
    let poster = SessionId::new();
    let peer = SessionId::new();
    let poster_inbox = store.subscribe(&poster);
    let peer_inbox = store.subscribe(&peer);

    // WHEN the poster reports a commit
    let changes = SnapshotChanges {
        updated: vec![SnapshotUpdate {
            id: artist(1),
            values: name_row(1, "a"),
            replaces_version: None,
        }],
        deleted: vec![artist(2)],
        ..SnapshotChanges::default()
    };
    let installed = store.process_changes(Some(&poster), changes);

    // THEN only the peer hears about it
    assert!(installed.contains_key(&artist(1)));
    assert!(poster_inbox.try_recv().is_err());
    let event = peer_inbox.try_recv().unwrap();
    assert_eq!(event.posted_by.as_ref(), Some(&poster));
    assert_eq!(event.modified.len(), 1);
    assert_eq!(event.deleted, vec![artist(2)]);
}

#[test]
fn test_publishing_does_not_wait_for_slow_readers() {
    // GIVEN a subscriber that never drains its inbox
    let store = SnapshotStore::new("shared", 10_000, None);
    let _inbox = store.subscribe(&SessionId::new());

    // WHEN many events are published
    for i in 0..1_000 {
        store.put(artist(1), name_row(1, &format!("v{}", i)));
    }

    // THEN publishing completed and the last value is cached
    assert_eq!(
        store.get(&artist(1)).and_then(|s| s.get("ARTIST_NAME").cloned()),
        Some(Value::from("v999"))
    );
}

#[test]
fn test_reads_of_expired_entries_never_drop_a_fresh_put() {
    // GIVEN a short expiry and readers spinning on one identity
    let ttl = Duration::from_millis(150);
    let store = Arc::new(SnapshotStore::new("shared", 100, Some(ttl)));
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    store.get(&artist(1));
                }
            })
        })
        .collect();

    // WHEN the writer replaces the entry each time the previous one expired
    for i in 0..8 {
        thread::sleep(ttl + Duration::from_millis(10));
        store.put(artist(1), name_row(1, &format!("v{}", i)));

        // THEN the fresh snapshot is still there
        assert_eq!(
            store.get(&artist(1)).and_then(|s| s.get("ARTIST_NAME").cloned()),
            Some(Value::from(format!("v{}", i).as_str()))
        );
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}
