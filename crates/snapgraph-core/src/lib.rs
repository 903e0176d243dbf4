//! Snapgraph Core - Object graph identity and snapshot cache
//!
//! This crate keeps an in-memory graph of persistent domain objects on top
//! of an external row store, including:
//! - Per-session identity maps with a persistence lifecycle per object
//! - Transparent faulting of hollow objects and unresolved relationships
//! - A shared, versioned snapshot store with change notifications
//! - Per-session change tracking, compaction and three-way merge
//! - Ordered write-through commits with optimistic locking
//! - Nested sessions that flush into a parent instead of storage
//!
//! Storage itself sits behind the [`collab::RowSource`] and
//! [`collab::WriteSink`] traits.

pub use snapgraph_core_types as core_types;

pub mod collab;
pub mod commit;
pub mod config;
pub mod diff;
pub mod errors;
pub mod graph;
pub mod logging_facility;
pub mod model;
pub mod policy;
pub mod resolve;
pub mod session;
pub mod snapshot;

// Re-export commonly used types
pub use commit::CommitSummary;
pub use config::CacheConfig;
pub use errors::{ExError, ExErrorKind, GraphError, LockFailure, Result};
pub use graph::{ObjectHandle, ObjectView, PersistenceState};
pub use model::{row, EntityDescriptor, EntityResolver, ObjectId, Relationship, Row, Value};
pub use policy::{SessionDelegate, ValidationHook, ValidationPhase};
pub use resolve::{FetchSpec, PrefetchSemantics};
pub use session::{Runtime, RuntimeBuilder, Session};
pub use snapshot::{Snapshot, SnapshotStore};
