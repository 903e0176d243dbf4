//! Object graph: domain objects and the per-session identity map

pub mod identity_map;
pub mod object;

pub use identity_map::{IdentityMap, ObjectHandle};
pub use object::{ArcValue, DomainObject, ObjectView, PersistenceState};
