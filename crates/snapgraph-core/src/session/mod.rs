//! Session facade: one unit of work over a shared snapshot store
//!
//! A session owns its identity map and change tracker exclusively. The
//! snapshot store is the only state it shares with other sessions; changes
//! posted by peers arrive through an inbox that is drained at the start of
//! every public operation.

mod edit;
mod events;
mod nested;
mod runtime;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use indexmap::IndexMap;
use snapgraph_core_types::SessionId;

pub(crate) use edit::ArcEdit;
pub(crate) use nested::{Inherited, ParentView};
pub use runtime::{Runtime, RuntimeBuilder};

use crate::diff::{ChangeTracker, Checkpoint, DiffEntry, DiffOp};
use crate::errors::{GraphError, Result};
use crate::graph::{ArcValue, IdentityMap, ObjectHandle, ObjectView, PersistenceState};
use crate::model::{EntityResolver, ObjectId, Row, Value};
use crate::resolve::Need;
use crate::snapshot::{Snapshot, SnapshotChanges, SnapshotEvent, SnapshotStore};
use crate::{log_op_end, log_op_error, log_op_start};

pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) store: Arc<SnapshotStore>,
    inbox: Receiver<Arc<SnapshotEvent>>,
    pub(crate) graph: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    /// Set on child sessions only
    pub(crate) parent_view: Option<Arc<ParentView>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("store", &self.store.name())
            .field("registered", &self.graph.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub(crate) fn resolver(&self) -> Arc<EntityResolver> {
        Arc::clone(&self.runtime.resolver)
    }

    /// Register a NEW object of `entity` under a temporary identity
    ///
    /// Attributes start out null and relationships resolved and empty.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` for an unmapped entity.
    pub fn new_object(&mut self, entity: &str) -> Result<ObjectHandle> {
        self.process_events();
        let root = self.resolver().root_entity(entity)?.name.clone();
        self.register_created(ObjectId::temporary(root), entity, None)
    }

    /// Register a NEW object whose primary key is already known
    ///
    /// The object keeps a temporary identity until it is inserted; the key
    /// is reserved meanwhile, so fetching the same row in this session
    /// fails with `IdentityConflict`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when `key` lacks a primary key column and
    /// `IdentityConflict` when the identity is already registered.
    pub fn new_object_with_key(&mut self, entity: &str, key: Row) -> Result<ObjectHandle> {
        self.process_events();
        let resolver = self.resolver();
        let permanent = resolver.object_id_from_row(entity, &key)?;
        let root = resolver.root_entity(entity)?.name.clone();
        self.register_created(ObjectId::temporary(root), entity, Some(permanent))
    }

    /// Register an object created elsewhere (a new object or a child
    /// session's flush) and log its creation
    pub(crate) fn register_created(
        &mut self,
        id: ObjectId,
        entity: &str,
        preassigned: Option<ObjectId>,
    ) -> Result<ObjectHandle> {
        let resolver = self.resolver();
        let attributes = resolver.attributes(entity)?;
        let relationships = resolver.relationships(entity)?;
        let handle = self.graph.register_new(id.clone(), entity, preassigned)?;

        let object = self.graph.get_mut(handle)?;
        object.values = attributes
            .iter()
            .map(|a| (a.name.clone(), Value::Null))
            .collect();
        object.arcs = relationships
            .iter()
            .map(|r| {
                let empty = if r.is_to_one() {
                    ArcValue::ToOne(None)
                } else {
                    ArcValue::ToMany(Vec::new())
                };
                (r.name.clone(), empty)
            })
            .collect();
        self.tracker.record_created(&id);
        Ok(handle)
    }

    /// HOLLOW object for a known identity, without fetching
    ///
    /// Returns the registered object if there already is one.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` when the identity's entity is not mapped.
    pub fn local_object(&mut self, id: &ObjectId) -> Result<ObjectHandle> {
        self.process_events();
        self.resolver().entity(id.entity())?;
        self.target_handle(id)
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<ObjectHandle> {
        self.graph.lookup(id)
    }

    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for handles of removed objects.
    pub fn object_id(&self, handle: ObjectHandle) -> Result<ObjectId> {
        Ok(self.graph.get(handle)?.id.clone())
    }

    /// State of the object; TRANSIENT once it left the session
    pub fn state(&self, handle: ObjectHandle) -> PersistenceState {
        self.graph
            .get(handle)
            .map(|o| o.state())
            .unwrap_or(PersistenceState::Transient)
    }

    /// Read-only view without resolving anything
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for handles of removed objects.
    pub fn view(&self, handle: ObjectHandle) -> Result<ObjectView<'_>> {
        Ok(ObjectView::new(self.graph.get(handle)?))
    }

    /// Attribute value; may fetch the row of a HOLLOW object
    ///
    /// # Errors
    ///
    /// Returns `UnknownProperty` for unmapped attributes and
    /// `FaultResolutionFailure` when a HOLLOW object's row is gone.
    pub fn read(&mut self, handle: ObjectHandle, attribute: &str) -> Result<Value> {
        self.process_events();
        let entity = self.graph.get(handle)?.entity.clone();
        self.resolver().attribute(&entity, attribute)?;
        self.ensure(handle, Need::Attributes)?;
        Ok(self
            .graph
            .get(handle)?
            .value(attribute)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Every attribute value; may fetch the row of a HOLLOW object
    ///
    /// # Errors
    ///
    /// Returns `FaultResolutionFailure` when a HOLLOW object's row is gone.
    pub fn values(&mut self, handle: ObjectHandle) -> Result<IndexMap<String, Value>> {
        self.process_events();
        self.ensure(handle, Need::Attributes)?;
        Ok(self.graph.get(handle)?.values().clone())
    }

    /// Write an attribute
    ///
    /// Writing the value an attribute already holds is still recorded (as a
    /// phantom change) and still marks the object MODIFIED.
    ///
    /// # Errors
    ///
    /// Returns `IllegalStateTransition` on DELETED objects, `UnknownProperty`
    /// for unmapped attributes and `FaultResolutionFailure` when a HOLLOW
    /// object's row is gone.
    pub fn set(
        &mut self,
        handle: ObjectHandle,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.process_events();
        self.check_editable(handle, "set")?;
        let entity = self.graph.get(handle)?.entity.clone();
        self.resolver().attribute(&entity, attribute)?;
        self.ensure(handle, Need::Attributes)?;
        self.write_attribute(handle, attribute, value.into())
    }

    pub(crate) fn write_attribute(
        &mut self,
        handle: ObjectHandle,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        let object = self.graph.get_mut(handle)?;
        let old = object
            .values
            .insert(attribute.to_string(), value.clone())
            .unwrap_or(Value::Null);
        let id = object.id.clone();
        self.tracker.record_attribute_change(&id, attribute, old, value);
        self.mark_modified(handle)
    }

    pub(crate) fn check_editable(&self, handle: ObjectHandle, op: &str) -> Result<()> {
        let object = self.graph.get(handle)?;
        if object.state() == PersistenceState::Deleted {
            return Err(GraphError::IllegalStateTransition {
                object_id: object.id.to_string(),
                state: object.state().to_string(),
                op: op.to_string(),
            });
        }
        Ok(())
    }

    /// COMMITTED objects become MODIFIED; other states are kept
    pub(crate) fn mark_modified(&mut self, handle: ObjectHandle) -> Result<()> {
        let object = self.graph.get_mut(handle)?;
        if object.state == PersistenceState::Committed {
            object.state = PersistenceState::Modified;
        }
        Ok(())
    }

    /// Whether anything was recorded since the last commit, rollback or
    /// flush, phantom writes included
    pub fn has_pending_changes(&self) -> bool {
        self.tracker.has_changes()
    }

    pub fn objects_in_state(&self, state: PersistenceState) -> Vec<ObjectHandle> {
        self.graph.handles_in_state(state)
    }

    pub fn registered_count(&self) -> usize {
        self.graph.len()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.tracker.checkpoint()
    }

    pub fn diffs_since(&self, checkpoint: Checkpoint) -> Vec<DiffEntry> {
        self.tracker.diffs_since(checkpoint)
    }

    /// Run validation hooks for the object on the next commit even if its
    /// changes are all phantom
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for handles of removed objects.
    pub fn mark_for_validation(&mut self, handle: ObjectHandle) -> Result<()> {
        let id = self.graph.get(handle)?.id.clone();
        self.tracker.mark_force_validation(&id);
        self.mark_modified(handle)
    }

    /// Turn objects HOLLOW and evict their snapshots
    ///
    /// Pending changes of the objects are discarded. NEW objects are skipped.
    /// Peers sharing the store are told the identities were invalidated.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for handles of removed objects.
    pub fn invalidate(&mut self, handles: &[ObjectHandle]) -> Result<()> {
        self.process_events();
        let mut invalidated = Vec::new();
        for handle in handles {
            let object = self.graph.get_mut(*handle)?;
            if object.state == PersistenceState::New {
                continue;
            }
            object.state = PersistenceState::Hollow;
            object.values.clear();
            object.arcs.clear();
            object.baseline.clear();
            object.upstream = None;
            object.snapshot_version = None;
            let id = object.id.clone();
            self.tracker.clear(&id);
            invalidated.push(id);
        }
        if !invalidated.is_empty() {
            self.store.process_changes(
                Some(&self.id),
                SnapshotChanges {
                    invalidated,
                    ..SnapshotChanges::default()
                },
            );
        }
        Ok(())
    }

    /// Remove objects from this session; they become TRANSIENT
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for handles of removed objects.
    pub fn unregister(&mut self, handles: &[ObjectHandle]) -> Result<()> {
        for handle in handles {
            let removed = self.graph.unregister(*handle)?;
            self.tracker.clear(&removed.id);
        }
        Ok(())
    }

    /// Discard every pending change
    ///
    /// NEW objects become TRANSIENT. MODIFIED and DELETED objects take the
    /// cached snapshot (or the row they were last synchronised with) and
    /// become COMMITTED; in a child session, objects the parent has pending
    /// state for take that state again. Relationships touched by the
    /// discarded changes turn back into faults.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` if the graph is inconsistent.
    pub fn rollback(&mut self) -> Result<()> {
        self.process_events();
        log_op_start!("rollback", session_id = %self.id);
        let start = Instant::now();

        let reverted = self.rollback_impl().map_err(|e| {
            log_op_error!(
                "rollback",
                e.clone(),
                session_id = &self.id,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "rollback",
            duration_ms = start.elapsed().as_millis() as u64,
            object_count = reverted
        );
        Ok(())
    }

    fn rollback_impl(&mut self) -> Result<usize> {
        let resolver = self.resolver();

        // relationships to fault afterwards, reverse sides included
        let mut touched: HashSet<(ObjectId, String)> = HashSet::new();
        for id in self.tracker.ids() {
            let Some(diff) = self.tracker.diff(id) else {
                continue;
            };
            let entity = match self.graph.lookup(id) {
                Some(handle) => self.graph.get(handle)?.entity.clone(),
                None => id.entity().to_string(),
            };
            for entry in diff.entries() {
                let Some(relationship) = entry.op.relationship() else {
                    continue;
                };
                touched.insert((id.clone(), relationship.to_string()));
                let rel = resolver.relationship(&entity, relationship)?;
                if let Some(reverse) = resolver.reverse_of(rel)? {
                    if let DiffOp::Arc {
                        target, previous, ..
                    } = &entry.op
                    {
                        for other in target.iter().chain(previous.iter()) {
                            touched.insert((other.clone(), reverse.name.clone()));
                        }
                    }
                }
            }
        }

        let mut reverted = 0usize;
        for handle in self.graph.handles() {
            let object = self.graph.get(handle)?;
            let state = object.state();
            let temporary = object.id.is_temporary();
            let mirrored = self.mirrors_parent(&object.id);
            match state {
                PersistenceState::New => {
                    self.graph.unregister(handle)?;
                    reverted += 1;
                }
                PersistenceState::Modified | PersistenceState::Deleted if mirrored => {
                    self.graph.get_mut(handle)?.state = PersistenceState::Hollow;
                    self.inherit_from_parent(handle)?;
                    reverted += 1;
                }
                PersistenceState::Modified | PersistenceState::Deleted if temporary => {
                    self.graph.unregister(handle)?;
                    reverted += 1;
                }
                PersistenceState::Modified | PersistenceState::Deleted => {
                    let version = object.snapshot_version;
                    match self.store.get(&object.id) {
                        Some(snapshot) => self.apply_snapshot(handle, &snapshot)?,
                        None => {
                            let baseline = Snapshot {
                                values: object.current_row().clone(),
                                version: version.unwrap_or_default(),
                                replaces_version: None,
                            };
                            self.apply_snapshot(handle, &baseline)?;
                            self.graph.get_mut(handle)?.snapshot_version = version;
                        }
                    }
                    reverted += 1;
                }
                _ => {}
            }
        }

        for (id, relationship) in touched {
            if let Some(handle) = self.graph.lookup(&id) {
                let object = self.graph.get_mut(handle)?;
                if object.state != PersistenceState::New {
                    object.arcs.shift_remove(&relationship);
                }
            }
        }
        self.tracker.clear_all();
        Ok(reverted)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.id);
    }
}
