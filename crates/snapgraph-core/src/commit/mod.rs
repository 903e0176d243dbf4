//! Commit coordinator
//!
//! One commit runs collect, validate, order, lock check, write-through and
//! publish in sequence. Everything before write-through only reads the
//! session, and write-through runs inside one storage transaction that is
//! rolled back on any failure, so a failed commit leaves the session exactly
//! as it was.

mod coordinator;
mod plan;

pub use plan::dependency_order;

use serde::Serialize;
use snapgraph_core_types::CommitId;

/// What one successful commit wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub commit_id: CommitId,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Join table rows inserted or deleted
    pub join_rows: usize,
    /// Nothing had to be written; storage was not contacted
    pub phantom: bool,
}
