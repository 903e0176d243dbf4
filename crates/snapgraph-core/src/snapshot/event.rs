//! Change notifications posted by a snapshot store to its subscribers

use std::sync::Arc;

use snapgraph_core_types::SessionId;

use super::Snapshot;
use crate::model::ObjectId;

/// One identity whose snapshot was replaced
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChange {
    pub id: ObjectId,
    /// Previously cached snapshot, when one was present
    pub before: Option<Arc<Snapshot>>,
    pub after: Arc<Snapshot>,
}

/// Batched notification for one store mutation
///
/// Subscribers skip events whose `posted_by` is their own session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotEvent {
    /// Name of the posting store
    pub source: String,
    pub posted_by: Option<SessionId>,
    pub modified: Vec<SnapshotChange>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
    /// Identities whose to-many relationships changed without a row change
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}
