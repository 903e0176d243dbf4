//! Change tracking: diff log, compaction and snapshot merge

pub mod merge;
pub mod model;
pub mod tracker;

pub use merge::{merge, MergeOutcome};
pub use model::{compact_entries, ArcChangeKind, DiffEntry, DiffOp, ObjectDiff};
pub use tracker::{ChangeTracker, Checkpoint};
