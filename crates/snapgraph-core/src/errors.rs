use snapgraph_core_types::SessionId;
use thiserror::Error;

use crate::model::{ObjectId, Row};
use crate::policy::ValidationPhase;

/// Result type alias using GraphError
pub type Result<T> = std::result::Result<T, GraphError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// Each kind maps to a stable error code that can be used for programmatic
/// error handling, testing, and reporting across the collaborator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExErrorKind {
    // Identity
    IdentityConflict,
    NotRegistered,

    // Mapping
    UnknownEntity,
    UnknownProperty,
    InvalidMapping,

    // Lifecycle
    IllegalState,
    DeleteDenied,

    // Commit
    ValidationFailure,
    OptimisticLock,
    CommitFailure,

    // Faulting
    FaultResolution,

    // Integration
    Storage,
    Config,

    // Internal
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::IdentityConflict => "ERR_IDENTITY_CONFLICT",
            ExErrorKind::NotRegistered => "ERR_NOT_REGISTERED",
            ExErrorKind::UnknownEntity => "ERR_UNKNOWN_ENTITY",
            ExErrorKind::UnknownProperty => "ERR_UNKNOWN_PROPERTY",
            ExErrorKind::InvalidMapping => "ERR_INVALID_MAPPING",
            ExErrorKind::IllegalState => "ERR_ILLEGAL_STATE",
            ExErrorKind::DeleteDenied => "ERR_DELETE_DENIED",
            ExErrorKind::ValidationFailure => "ERR_VALIDATION_FAILURE",
            ExErrorKind::OptimisticLock => "ERR_OPTIMISTIC_LOCK",
            ExErrorKind::CommitFailure => "ERR_COMMIT_FAILURE",
            ExErrorKind::FaultResolution => "ERR_FAULT_RESOLUTION",
            ExErrorKind::Storage => "ERR_STORAGE",
            ExErrorKind::Config => "ERR_CONFIG",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }
}

/// Canonical structured error type
///
/// Carries classification fields for programmatic handling and the context
/// (operation, entity, object id, session) needed to debug a failure.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity: Option<String>,
    object_id: Option<String>,
    session_id: Option<SessionId>,
    message: String,
    source: Option<Box<ExError>>,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity: None,
            object_id: None,
            session_id: None,
            message: String::new(),
            source: None,
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity name context
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Add object id context
    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    /// Add session context
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add source error
    pub fn with_source(mut self, source: ExError) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source_error(&self) -> Option<&ExError> {
        self.source.as_deref()
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity) = &self.entity {
            write!(f, " (entity: {})", entity)?;
        }
        if let Some(object_id) = &self.object_id {
            write!(f, " (object_id: {})", object_id)?;
        }
        if let Some(session_id) = &self.session_id {
            write!(f, " (session: {})", session_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

// ========== End Error Facility ==========

/// One identity that failed its optimistic lock check
#[derive(Debug, Clone, PartialEq)]
pub struct LockFailure {
    /// Identity whose stored row no longer matches the captured lock values
    pub object_id: ObjectId,
    /// Fresh row observed in storage, or `None` if the row was deleted
    pub fresh_snapshot: Option<Row>,
}

fn describe_lock_failures(failures: &[LockFailure]) -> String {
    failures
        .iter()
        .map(|f| match f.fresh_snapshot {
            Some(_) => f.object_id.to_string(),
            None => format!("{} (deleted)", f.object_id),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error taxonomy for object graph operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    // ===== Identity Errors =====
    /// Remap or registration target is already bound to a different object
    #[error("Identity conflict: {new_id} is already bound to another object (while binding {old_id})")]
    IdentityConflict { old_id: String, new_id: String },

    /// Handle does not refer to a registered object
    #[error("Object handle {handle} is not registered in this session")]
    ObjectNotRegistered { handle: u64 },

    // ===== Mapping Errors =====
    #[error("Unknown entity: {entity}")]
    UnknownEntity { entity: String },

    #[error("Unknown property {property} on entity {entity}")]
    UnknownProperty { entity: String, property: String },

    /// Entity mapping is internally inconsistent
    #[error("Invalid mapping: {reason}")]
    InvalidMapping { reason: String },

    // ===== Lifecycle Errors =====
    #[error("Illegal operation '{op}' on {object_id} in state {state}")]
    IllegalStateTransition {
        object_id: String,
        state: String,
        op: String,
    },

    /// A `Deny` delete rule found related objects
    #[error("Cannot delete {object_id}: relationship {relationship} still has related objects")]
    DeleteDenied {
        object_id: String,
        relationship: String,
    },

    // ===== Commit Errors =====
    /// Raised by a validation hook; aborts the whole commit
    #[error("Validation failed for {object_id} ({phase:?}): {message}")]
    ValidationFailure {
        object_id: String,
        phase: ValidationPhase,
        message: String,
    },

    /// Stored rows changed (or vanished) since this unit of work captured them
    #[error("Optimistic lock failure: {}", describe_lock_failures(.failures))]
    OptimisticLockFailure { failures: Vec<LockFailure> },

    /// Generic write-through failure
    #[error("Commit failed: {message}")]
    CommitFailure { message: String },

    // ===== Faulting Errors =====
    /// The row backing a HOLLOW object or fault no longer exists
    #[error("Cannot resolve {object_id}: {reason}")]
    FaultResolutionFailure { object_id: String, reason: String },

    // ===== Generic Errors =====
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GraphError {
    /// Lock failures carried by this error; empty for every other variant
    pub fn lock_failures(&self) -> &[LockFailure] {
        match self {
            GraphError::OptimisticLockFailure { failures } => failures,
            _ => &[],
        }
    }
}

/// Conversion from GraphError to ExError
impl From<GraphError> for ExError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::IdentityConflict { old_id, new_id } => {
                ExError::new(ExErrorKind::IdentityConflict)
                    .with_object_id(new_id)
                    .with_message(format!("already bound while binding {}", old_id))
            }

            GraphError::ObjectNotRegistered { handle } => ExError::new(ExErrorKind::NotRegistered)
                .with_message(format!("handle {} is not registered", handle)),

            GraphError::UnknownEntity { entity } => ExError::new(ExErrorKind::UnknownEntity)
                .with_entity(entity)
                .with_message("Unknown entity"),

            GraphError::UnknownProperty { entity, property } => {
                ExError::new(ExErrorKind::UnknownProperty)
                    .with_entity(entity)
                    .with_message(format!("Unknown property {}", property))
            }

            GraphError::InvalidMapping { reason } => {
                ExError::new(ExErrorKind::InvalidMapping).with_message(reason)
            }

            GraphError::IllegalStateTransition {
                object_id,
                state,
                op,
            } => ExError::new(ExErrorKind::IllegalState)
                .with_op(op)
                .with_object_id(object_id)
                .with_message(format!("object is {}", state)),

            GraphError::DeleteDenied {
                object_id,
                relationship,
            } => ExError::new(ExErrorKind::DeleteDenied)
                .with_op("delete_object")
                .with_object_id(object_id)
                .with_message(format!("{} has related objects", relationship)),

            GraphError::ValidationFailure {
                object_id,
                phase,
                message,
            } => ExError::new(ExErrorKind::ValidationFailure)
                .with_op("commit")
                .with_object_id(object_id)
                .with_message(format!("{:?}: {}", phase, message)),

            GraphError::OptimisticLockFailure { failures } => {
                let mut ex = ExError::new(ExErrorKind::OptimisticLock)
                    .with_op("commit")
                    .with_message(describe_lock_failures(&failures));
                if let [single] = failures.as_slice() {
                    ex = ex
                        .with_entity(single.object_id.entity())
                        .with_object_id(single.object_id.to_string());
                }
                ex
            }

            GraphError::CommitFailure { message } => ExError::new(ExErrorKind::CommitFailure)
                .with_op("commit")
                .with_message(message),

            GraphError::FaultResolutionFailure { object_id, reason } => {
                ExError::new(ExErrorKind::FaultResolution)
                    .with_op("resolve")
                    .with_object_id(object_id)
                    .with_message(reason)
            }

            GraphError::Storage { message } => {
                ExError::new(ExErrorKind::Storage).with_message(message)
            }

            GraphError::InvalidConfig { reason } => {
                ExError::new(ExErrorKind::Config).with_message(reason)
            }

            GraphError::Internal { message } => {
                ExError::new(ExErrorKind::Internal).with_message(message)
            }
        }
    }
}

/// Conversion from a collaborator storage error
impl From<crate::collab::StorageError> for GraphError {
    fn from(err: crate::collab::StorageError) -> Self {
        GraphError::Storage {
            message: err.to_string(),
        }
    }
}
