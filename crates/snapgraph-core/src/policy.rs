//! Validation hooks and session delegates
//!
//! Both are injected into a [`Runtime`](crate::session::Runtime) and shared
//! by its sessions. A validation hook may veto a commit; a delegate may veto
//! how a session applies changes posted by its peers.

use serde::{Deserialize, Serialize};

use crate::graph::ObjectView;
use crate::snapshot::SnapshotChange;

/// Point in the commit cycle at which a hook is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationPhase {
    PreInsert,
    PreUpdate,
    PreDelete,
    /// After storage committed; failures are logged and ignored
    PostCommit,
}

/// Externally supplied object validation
///
/// Returning `Err(message)` from a pre-write phase aborts the whole commit
/// with `GraphError::ValidationFailure`.
///
/// # Example
/// ```
/// use snapgraph_core::graph::ObjectView;
/// use snapgraph_core::policy::{ValidationHook, ValidationPhase};
///
/// struct PermanentGalleries;
///
/// impl ValidationHook for PermanentGalleries {
///     fn validate(&self, view: &ObjectView<'_>, phase: ValidationPhase) -> Result<(), String> {
///         if phase == ValidationPhase::PreDelete && view.entity() == "Gallery" {
///             return Err("galleries are permanent".to_string());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait ValidationHook: Send + Sync {
    fn validate(&self, object: &ObjectView<'_>, phase: ValidationPhase) -> Result<(), String>;
}

impl<F> ValidationHook for F
where
    F: Fn(&ObjectView<'_>, ValidationPhase) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, object: &ObjectView<'_>, phase: ValidationPhase) -> Result<(), String> {
        self(object, phase)
    }
}

/// Hook that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidationHook;

impl ValidationHook for NoopValidationHook {
    fn validate(&self, _object: &ObjectView<'_>, _phase: ValidationPhase) -> Result<(), String> {
        Ok(())
    }
}

/// Hook that rejects every pre-write phase (useful in tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllValidationHook;

impl ValidationHook for DenyAllValidationHook {
    fn validate(&self, object: &ObjectView<'_>, phase: ValidationPhase) -> Result<(), String> {
        match phase {
            ValidationPhase::PostCommit => Ok(()),
            _ => Err(format!("{} rejected", object.id())),
        }
    }
}

/// Veto points consulted while a session applies peer events
pub trait SessionDelegate: Send + Sync {
    /// Whether a committed or modified object should take the peer's new
    /// snapshot
    fn should_merge_changes(&self, _object: &ObjectView<'_>, _change: &SnapshotChange) -> bool {
        true
    }

    /// Whether a peer delete should remove the object from this session
    fn should_process_delete(&self, _object: &ObjectView<'_>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDelegate;

impl SessionDelegate for DefaultDelegate {}
