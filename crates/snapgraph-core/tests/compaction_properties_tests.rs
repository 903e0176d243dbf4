#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use snapgraph_core::diff::{compact_entries, ArcChangeKind, ChangeTracker, DiffOp};
use snapgraph_core::model::{ObjectId, Value};

fn artist() -> ObjectId {
    ObjectId::single("Artist", "ARTIST_ID", Value::Int(1))
}

fn painting(n: i64) -> ObjectId {
    ObjectId::single("Painting", "PAINTING_ID", Value::Int(n))
}

proptest! {
    /// Replaying the compacted to-many log on the starting membership gives
    /// the same membership as replaying the full log
    #[test]
    fn prop_compacted_membership_matches_full_log(
        initial in proptest::collection::btree_set(0i64..4, 0..4),
        toggles in proptest::collection::vec(0i64..4, 0..24),
    ) {
        let mut tracker = ChangeTracker::new();
        let mut members = initial.clone();
        for n in toggles {
            let kind = if members.remove(&n) {
                ArcChangeKind::Remove
            } else {
                members.insert(n);
                ArcChangeKind::Add
            };
            tracker.record_arc_change(&artist(), "paintingArray", Some(painting(n)), None, kind);
        }

        let mut replayed: BTreeSet<i64> = initial;
        for entry in compact_entries(&tracker.all_entries()) {
            if let DiffOp::Arc { target: Some(target), kind, .. } = entry.op {
                let n = target.key_value("PAINTING_ID").and_then(Value::as_i64).unwrap();
                match kind {
                    ArcChangeKind::Add => prop_assert!(replayed.insert(n)),
                    ArcChangeKind::Remove => prop_assert!(replayed.remove(&n)),
                    ArcChangeKind::Set => prop_assert!(false, "unexpected set"),
                }
            }
        }
        prop_assert_eq!(replayed, members);
    }

    /// Net attribute changes keep the first old and the last new value
    #[test]
    fn prop_attribute_writes_collapse(
        writes in proptest::collection::vec((0usize..2, 0i64..5), 1..16),
    ) {
        let names = ["artistName", "dateOfBirth"];
        let mut tracker = ChangeTracker::new();
        let mut current = [Value::Int(100), Value::Int(200)];
        let original = current.clone();
        for (i, v) in &writes {
            let new = Value::Int(*v);
            tracker.record_attribute_change(&artist(), names[*i], current[*i].clone(), new.clone());
            current[*i] = new;
        }

        let compacted = compact_entries(&tracker.all_entries());
        for entry in &compacted {
            let DiffOp::Attribute { name, old, new } = &entry.op else {
                continue;
            };
            let i = names.iter().position(|n| n == name).unwrap();
            prop_assert_eq!(old, &original[i]);
            prop_assert_eq!(new, &current[i]);
        }
        let touched: BTreeSet<usize> = writes.iter().map(|(i, _)| *i).collect();
        prop_assert_eq!(compacted.len(), touched.len());
    }

    /// An identity created and deleted in one log leaves nothing behind
    #[test]
    fn prop_created_then_deleted_vanishes(
        values in proptest::collection::vec(0i64..5, 0..8),
    ) {
        let id = ObjectId::temporary("Painting");
        let mut tracker = ChangeTracker::new();
        tracker.record_created(&id);
        for v in values {
            tracker.record_attribute_change(&id, "paintingTitle", Value::Null, Value::Int(v));
        }
        tracker.record_arc_change(&id, "toArtist", Some(artist()), None, ArcChangeKind::Set);
        tracker.record_deleted(&id);

        prop_assert!(compact_entries(&tracker.all_entries()).is_empty());
    }
}

#[test]
fn test_compacted_output_follows_recording_order() {
    // GIVEN changes on two identities, interleaved
    let mut tracker = ChangeTracker::new();
    tracker.record_attribute_change(&artist(), "artistName", "a".into(), "b".into());
    tracker.record_attribute_change(&painting(1), "paintingTitle", "x".into(), "y".into());
    tracker.record_attribute_change(&artist(), "dateOfBirth", Value::Null, Value::Int(1));

    // WHEN compacting
    let compacted = compact_entries(&tracker.all_entries());

    // THEN entries come back in sequence order
    let seqs: Vec<u64> = compacted.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(compacted.len(), 3);
}

#[test]
fn test_diffs_since_checkpoint() {
    let mut tracker = ChangeTracker::new();
    tracker.record_attribute_change(&artist(), "artistName", "a".into(), "b".into());
    let checkpoint = tracker.checkpoint();
    tracker.record_attribute_change(&artist(), "artistName", "b".into(), "c".into());

    let since = tracker.diffs_since(checkpoint);

    assert_eq!(since.len(), 1);
    assert!(matches!(&since[0].op, DiffOp::Attribute { new, .. } if *new == Value::from("c")));
}
