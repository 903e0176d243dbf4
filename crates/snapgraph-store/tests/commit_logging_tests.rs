#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{artist_id, fixture_with_hook, seed_artist};
use snapgraph_core::core_types::schema::{EVENT_END, EVENT_END_ERROR, EVENT_START};
use snapgraph_core::graph::ObjectView;
use snapgraph_core::logging_facility::test_capture::init_test_capture;
use snapgraph_core::{ValidationPhase, Value};

/// Rejects updates that clear an artist's name
fn named_artists(object: &ObjectView<'_>, phase: ValidationPhase) -> Result<(), String> {
    let unnamed = object.value("artistName").map_or(true, Value::is_null);
    if phase == ValidationPhase::PreUpdate && unnamed {
        return Err("artist needs a name".to_string());
    }
    Ok(())
}

#[test]
fn test_commit_logs_one_boundary_pair_per_attempt() {
    // GIVEN a session under test capture
    let capture = init_test_capture();
    let fx = fixture_with_hook(Arc::new(named_artists));
    seed_artist(&fx.storage, 1, "a");
    let mut session = fx.runtime.new_session();
    let artist = session.local_object(&artist_id(1)).unwrap();

    // WHEN one commit succeeds and one is vetoed
    session.set(artist, "artistName", "b").unwrap();
    session.commit().unwrap();
    session.set(artist, "artistName", Value::Null).unwrap();
    session.commit().unwrap_err();

    // THEN each attempt logged a start, and exactly one end of each kind
    assert_eq!(capture.boundary_count("commit", EVENT_START), 2);
    assert_eq!(capture.boundary_count("commit", EVENT_END), 1);
    assert_eq!(capture.boundary_count("commit", EVENT_END_ERROR), 1);

    let events = capture.events_for_op("commit");

    let start = events
        .iter()
        .find(|e| e.event.as_deref() == Some(EVENT_START))
        .unwrap();
    assert_eq!(start.field("session_id"), Some(session.id().to_string().as_str()));

    let failure = events
        .iter()
        .find(|e| e.event.as_deref() == Some(EVENT_END_ERROR))
        .unwrap();
    assert_eq!(failure.field("err_code"), Some("ERR_VALIDATION_FAILURE"));
    let session_id = session.id().to_string();
    assert_eq!(failure.field("session_id"), Some(session_id.as_str()));
    let message = failure.field("error").unwrap();
    assert!(message.contains("in operation 'commit'"), "{}", message);
    assert!(message.contains(&session_id), "{}", message);
}
