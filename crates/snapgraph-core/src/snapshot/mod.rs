//! Snapshot store: identity to last observed row, shared across sessions

pub mod entry;
pub mod event;
pub mod store;

pub use entry::Snapshot;
pub use event::{SnapshotChange, SnapshotEvent};
pub use store::{SnapshotChanges, SnapshotStore, SnapshotUpdate};
