#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{
    artist_id, fixture, fixture_with_hook, seed_artist, seed_exhibit, seed_gallery,
    seed_gallery_with_exhibit, seed_painting,
};
use snapgraph_core::collab::{StorageError, WriteOp};
use snapgraph_core::graph::ObjectView;
use snapgraph_core::policy::{DenyAllValidationHook, ValidationPhase};
use snapgraph_core::{row, FetchSpec, GraphError, PersistenceState, Value};
use snapgraph_store::sample::{ARTIST, ARTIST_EXHIBIT, EXHIBIT, PAINTING};

#[test]
fn test_optimistic_lock_failure_reports_fresh_row() {
    // GIVEN an artist inserted and committed as "a"
    let fx = fixture();
    let mut session = fx.runtime.new_session();
    let artist = session.new_object("Artist").unwrap();
    session.set(artist, "artistName", "a").unwrap();
    session.commit().unwrap();
    assert_eq!(session.object_id(artist).unwrap(), artist_id(1));

    // AND the row renamed to "b" out of band
    fx.storage
        .update_rows(
            ARTIST,
            &row([("ARTIST_ID", Value::Int(1))]),
            &row([("ARTIST_NAME", Value::from("b"))]),
        )
        .unwrap();

    // WHEN the cached object is renamed to "c" and committed
    session.set(artist, "artistName", "c").unwrap();
    let err = session.commit().unwrap_err();

    // THEN the lock failure names the artist and carries the stored row
    let failures = err.lock_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].object_id, artist_id(1));
    let fresh = failures[0].fresh_snapshot.as_ref().unwrap();
    assert_eq!(fresh.get("ARTIST_NAME"), Some(&Value::from("b")));

    // AND nothing was written and the edit is still pending
    assert_eq!(
        fx.storage.rows(ARTIST)[0].get("ARTIST_NAME"),
        Some(&Value::from("b"))
    );
    assert_eq!(session.state(artist), PersistenceState::Modified);
    assert!(session.has_pending_changes());
}

#[test]
fn test_lock_failure_keeps_unrelated_changes_pending() {
    // GIVEN a stale artist and an unrelated painting edit in one unit
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    seed_painting(&fx.storage, 10, "p", None);
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];
    let painting = session.select(&FetchSpec::new("Painting")).unwrap()[0];
    fx.storage
        .update_rows(
            ARTIST,
            &row([("ARTIST_ID", Value::Int(1))]),
            &row([("ARTIST_NAME", Value::from("b"))]),
        )
        .unwrap();
    session.set(artist, "artistName", "c").unwrap();
    session.set(painting, "paintingTitle", "q").unwrap();

    // WHEN committing
    let err = session.commit().unwrap_err();

    // THEN only the artist is reported and the painting edit survives
    assert!(matches!(err, GraphError::OptimisticLockFailure { .. }));
    assert_eq!(err.lock_failures().len(), 1);
    assert_eq!(session.state(painting), PersistenceState::Modified);
    assert_eq!(session.read(painting, "paintingTitle").unwrap(), Value::from("q"));
    assert_eq!(
        fx.storage.rows(PAINTING)[0].get("PAINTING_TITLE"),
        Some(&Value::from("p"))
    );

    // AND once the artist edit is dropped the painting commits
    session.invalidate(&[artist]).unwrap();
    session.commit().unwrap();
    assert_eq!(
        fx.storage.rows(PAINTING)[0].get("PAINTING_TITLE"),
        Some(&Value::from("q"))
    );
}

#[test]
fn test_phantom_write_commits_without_storage() {
    // GIVEN a committed artist
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];

    // WHEN the name is set to the value it already has
    session.set(artist, "artistName", "a").unwrap();

    // THEN the write counts as a change before commit
    assert!(session.has_pending_changes());
    assert_eq!(session.state(artist), PersistenceState::Modified);

    // AND the commit touches no storage
    let summary = session.commit().unwrap();
    assert!(summary.phantom);
    assert_eq!(fx.storage.transaction_count(), 0);
    assert_eq!(session.state(artist), PersistenceState::Committed);
    assert!(!session.has_pending_changes());
}

#[test]
fn test_update_writes_only_changed_columns() {
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];

    session.set(artist, "artistName", "z").unwrap();
    let summary = session.commit().unwrap();

    assert_eq!(summary.updated, 1);
    assert!(!summary.phantom);
    assert_eq!(fx.storage.commit_count(), 1);
    let stored = &fx.storage.rows(ARTIST)[0];
    assert_eq!(stored.get("ARTIST_NAME"), Some(&Value::from("z")));
    let log = fx.storage.write_log();
    assert!(matches!(
        &log[..],
        [WriteOp::Update { values, .. }] if values.len() == 1 && values.contains_key("ARTIST_NAME")
    ));
    let cached = session.snapshot_store().get(&artist_id(1)).unwrap();
    assert_eq!(cached.get("ARTIST_NAME"), Some(&Value::from("z")));
}

#[test]
fn test_insert_links_foreign_key_to_new_target() {
    // GIVEN a new painting pointing at a new artist
    let fx = fixture();
    let mut session = fx.runtime.new_session();
    let artist = session.new_object("Artist").unwrap();
    session.set(artist, "artistName", "a").unwrap();
    let painting = session.new_object("Painting").unwrap();
    session.set(painting, "paintingTitle", "p").unwrap();
    session.set_related(painting, "toArtist", Some(artist)).unwrap();

    // WHEN committing both
    let summary = session.commit().unwrap();

    // THEN the artist is inserted first and the painting carries its key
    assert_eq!(summary.inserted, 2);
    let rows = fx.storage.rows(PAINTING);
    assert_eq!(rows[0].get("ARTIST_ID"), Some(&Value::Int(1)));
    assert_eq!(session.related_many(artist, "paintingArray").unwrap(), vec![painting]);
}

#[test]
fn test_validation_failure_aborts_before_writing() {
    let fx = fixture_with_hook(Arc::new(DenyAllValidationHook));
    let mut session = fx.runtime.new_session();
    let artist = session.new_object("Artist").unwrap();
    session.set(artist, "artistName", "a").unwrap();

    let err = session.commit().unwrap_err();

    assert!(matches!(
        err,
        GraphError::ValidationFailure {
            phase: ValidationPhase::PreInsert,
            ..
        }
    ));
    assert_eq!(fx.storage.transaction_count(), 0);
    assert!(fx.storage.rows(ARTIST).is_empty());
    assert_eq!(session.state(artist), PersistenceState::New);
}

#[test]
fn test_validation_hook_sees_pending_values() {
    let hook = |view: &ObjectView<'_>, phase: ValidationPhase| {
        let blank = view.value("artistName").map_or(true, Value::is_null);
        if phase == ValidationPhase::PreInsert && view.entity() == "Artist" && blank {
            return Err("artist name is required".to_string());
        }
        Ok(())
    };
    let fx = fixture_with_hook(Arc::new(hook));
    let mut session = fx.runtime.new_session();
    let artist = session.new_object("Artist").unwrap();

    let err = session.commit().unwrap_err();
    assert!(err.to_string().contains("artist name is required"));

    session.set(artist, "artistName", "a").unwrap();
    assert_eq!(session.commit().unwrap().inserted, 1);
}

#[test]
fn test_storage_failure_rolls_back_and_keeps_changes() {
    // GIVEN a pending rename and storage that fails the next write
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];
    session.set(artist, "artistName", "z").unwrap();
    fx.storage
        .fail_next_write(StorageError::Unavailable("disk full".to_string()));

    // WHEN committing
    let err = session.commit().unwrap_err();

    // THEN storage is untouched and the rename is still pending
    assert!(matches!(err, GraphError::CommitFailure { .. }));
    assert_eq!(fx.storage.commit_count(), 0);
    assert_eq!(
        fx.storage.rows(ARTIST)[0].get("ARTIST_NAME"),
        Some(&Value::from("a"))
    );
    assert_eq!(session.state(artist), PersistenceState::Modified);

    // AND a retry succeeds
    session.commit().unwrap();
    assert_eq!(
        fx.storage.rows(ARTIST)[0].get("ARTIST_NAME"),
        Some(&Value::from("z"))
    );
}

#[test]
fn test_delete_removes_row_and_object() {
    let fx = fixture();
    seed_painting(&fx.storage, 10, "p", None);
    let mut session = fx.runtime.new_session();
    let painting = session.select(&FetchSpec::new("Painting")).unwrap()[0];

    session.delete_object(painting).unwrap();
    assert_eq!(session.state(painting), PersistenceState::Deleted);
    let summary = session.commit().unwrap();

    assert_eq!(summary.deleted, 1);
    assert!(fx.storage.rows(PAINTING).is_empty());
    assert_eq!(session.state(painting), PersistenceState::Transient);
    assert!(session.snapshot_store().get(&common::painting_id(10)).is_none());
}

#[test]
fn test_deleting_new_object_discards_it() {
    let fx = fixture();
    let mut session = fx.runtime.new_session();
    let painting = session.new_object("Painting").unwrap();

    session.delete_object(painting).unwrap();

    assert_eq!(session.state(painting), PersistenceState::Transient);
    assert!(session.commit().unwrap().phantom);
}

#[test]
fn test_deny_rule_blocks_delete() {
    // GIVEN a gallery with an exhibit
    let fx = fixture();
    seed_gallery(&fx.storage, 1, "g");
    seed_exhibit(&fx.storage, 10, 1);
    let mut session = fx.runtime.new_session();
    let gallery = session.select(&FetchSpec::new("Gallery")).unwrap()[0];

    // WHEN deleting the gallery
    let err = session.delete_object(gallery).unwrap_err();

    // THEN the delete is refused and nothing changed
    assert!(matches!(
        err,
        GraphError::DeleteDenied { ref relationship, .. } if relationship == "exhibitArray"
    ));
    assert_eq!(session.state(gallery), PersistenceState::Committed);
    assert!(!session.has_pending_changes());
}

#[test]
fn test_nullify_rule_clears_foreign_keys() {
    // GIVEN an artist with two paintings
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    seed_painting(&fx.storage, 10, "p", Some(1));
    seed_painting(&fx.storage, 11, "q", Some(1));
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];

    // WHEN deleting the artist
    session.delete_object(artist).unwrap();
    let summary = session.commit().unwrap();

    // THEN the paintings stay with a null artist
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.updated, 2);
    assert!(fx.storage.rows(ARTIST).is_empty());
    let paintings = fx.storage.rows(PAINTING);
    assert_eq!(paintings.len(), 2);
    assert!(paintings
        .iter()
        .all(|p| p.get("ARTIST_ID").map_or(true, Value::is_null)));
}

#[test]
fn test_cascade_rule_deletes_dependents() {
    // GIVEN an exhibit showing two artists
    let fx = fixture();
    seed_gallery_with_exhibit(&fx.storage);
    let mut session = fx.runtime.new_session();
    let exhibit = session.select(&FetchSpec::new("Exhibit")).unwrap()[0];

    // WHEN deleting the exhibit
    session.delete_object(exhibit).unwrap();
    let summary = session.commit().unwrap();

    // THEN its artist-exhibit rows go with it
    assert_eq!(summary.deleted, 3);
    assert!(fx.storage.rows(EXHIBIT).is_empty());
    assert!(fx.storage.rows(ARTIST_EXHIBIT).is_empty());
    assert_eq!(fx.storage.rows(ARTIST).len(), 2);
}

#[test]
fn test_rollback_restores_committed_state() {
    // GIVEN a rename, a new object and a delete pending
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    seed_painting(&fx.storage, 10, "p", None);
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];
    let painting = session.select(&FetchSpec::new("Painting")).unwrap()[0];
    session.set(artist, "artistName", "z").unwrap();
    let created = session.new_object("Gallery").unwrap();
    session.delete_object(painting).unwrap();

    // WHEN rolling back
    session.rollback().unwrap();

    // THEN every object is back to what storage holds
    assert!(!session.has_pending_changes());
    assert_eq!(session.read(artist, "artistName").unwrap(), Value::from("a"));
    assert_eq!(session.state(artist), PersistenceState::Committed);
    assert_eq!(session.state(painting), PersistenceState::Committed);
    assert_eq!(session.state(created), PersistenceState::Transient);
    assert!(session.commit().unwrap().phantom);
}

#[test]
fn test_checkpoint_reports_changes_made_after_it() {
    let fx = fixture();
    seed_artist(&fx.storage, 1, "a");
    let mut session = fx.runtime.new_session();
    let artist = session.select(&FetchSpec::new("Artist")).unwrap()[0];
    session.set(artist, "artistName", "b").unwrap();

    let checkpoint = session.checkpoint();
    session.set(artist, "dateOfBirth", "1900-01-01").unwrap();

    let since = session.diffs_since(checkpoint);
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].id, artist_id(1));
}
