//! Nested units of work
//!
//! A child session edits objects on its own and hands the result to a
//! parent session instead of storage. The parent replays the child's
//! compacted changes as if they had been made there, and commits them later.
//!
//! The child reads the parent's uncommitted state as it was when the child
//! was opened: objects the parent created, modified or deleted, and the
//! relationship edits the parent has pending. Everything else comes from
//! the snapshot store and storage as in any other session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::diff::{compact_entries, ArcChangeKind, DiffOp};
use crate::errors::{GraphError, Result};
use crate::graph::{DomainObject, ObjectHandle, PersistenceState};
use crate::model::ObjectId;
use crate::resolve::Need;
use crate::session::{ArcEdit, Session};
use crate::{log_op_end, log_op_error, log_op_start};

/// Uncommitted state of the parent chain, as seen by a child session
#[derive(Debug, Clone, Default)]
pub(crate) struct ParentView {
    /// NEW, MODIFIED and DELETED objects of the parent
    objects: HashMap<ObjectId, DomainObject>,
    /// Pending relationship edits per identity, oldest first
    arc_ops: HashMap<ObjectId, Vec<DiffOp>>,
}

impl ParentView {
    pub(crate) fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub(crate) fn arc_ops<'a>(
        &'a self,
        id: &ObjectId,
        relationship: &'a str,
    ) -> impl Iterator<Item = &'a DiffOp> + 'a {
        self.arc_ops
            .get(id)
            .into_iter()
            .flatten()
            .filter(move |op| op.relationship() == Some(relationship))
    }
}

/// How a child resolved an object against its parent view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inherited {
    /// The parent has nothing newer than storage
    Absent,
    /// Values and resolved arcs were copied from the parent
    Seeded,
    /// The parent deleted the object
    Deleted,
}

impl Session {
    /// Open a session on the same runtime, meant to be flushed into `self`
    ///
    /// The child sees this session's pending changes as of now.
    pub fn new_child(&self) -> Session {
        let mut child = self.runtime.new_session();
        child.parent_view = Some(Arc::new(self.capture_view()));
        child
    }

    fn capture_view(&self) -> ParentView {
        let mut view = self
            .parent_view
            .as_deref()
            .cloned()
            .unwrap_or_default();
        self.graph.for_each_registered(|_, object| {
            if matches!(
                object.state(),
                PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
            ) {
                view.objects.insert(object.id.clone(), object.clone());
            }
        });
        for id in self.tracker.ids() {
            let Some(diff) = self.tracker.diff(id) else {
                continue;
            };
            let ops = diff
                .entries()
                .iter()
                .filter(|e| e.op.relationship().is_some())
                .map(|e| e.op.clone());
            view.arc_ops.entry(id.clone()).or_default().extend(ops);
        }
        view
    }

    /// Whether this is a child whose parent has pending state for `id`
    pub(crate) fn mirrors_parent(&self, id: &ObjectId) -> bool {
        self.parent_view.as_ref().is_some_and(|v| v.contains(id))
    }

    /// Fill a HOLLOW object from the parent's pending state
    ///
    /// Seeded objects are COMMITTED here; their baseline is the parent's
    /// latest storage row, so untouched foreign keys still resolve.
    pub(crate) fn inherit_from_parent(&mut self, handle: ObjectHandle) -> Result<Inherited> {
        let Some(view) = self.parent_view.clone() else {
            return Ok(Inherited::Absent);
        };
        let object = self.graph.get(handle)?;
        let Some(source) = view.objects.get(&object.id) else {
            return Ok(Inherited::Absent);
        };
        if source.state() == PersistenceState::Deleted {
            return Ok(Inherited::Deleted);
        }

        let object = self.graph.get_mut(handle)?;
        object.entity = source.entity.clone();
        object.values = source.values.clone();
        object.arcs = source
            .arcs
            .iter()
            .filter(|(_, arc)| !arc.is_fault())
            .map(|(name, arc)| (name.clone(), arc.clone()))
            .collect();
        object.baseline = source.current_row().clone();
        object.upstream = None;
        object.snapshot_version = source.snapshot_version;
        object.state = PersistenceState::Committed;
        Ok(Inherited::Seeded)
    }

    /// Replay this session's pending changes onto `parent`
    ///
    /// Objects created here are created in the parent under the same
    /// temporary identity. Afterwards this session's objects are COMMITTED
    /// (deleted ones are removed) and its change log is empty. Returns the
    /// number of compacted changes replayed.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the sessions belong to different runtimes and
    /// `FaultResolutionFailure` when a parent object's row is gone.
    pub fn flush_to_parent(&mut self, parent: &mut Session) -> Result<usize> {
        self.process_events();
        parent.process_events();
        log_op_start!("flush_to_parent", session_id = %self.id, parent_id = %parent.id);
        let start = Instant::now();

        let replayed = self.flush_impl(parent).map_err(|e| {
            log_op_error!(
                "flush_to_parent",
                e.clone(),
                session_id = &self.id,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "flush_to_parent",
            duration_ms = start.elapsed().as_millis() as u64,
            entry_count = replayed
        );
        Ok(replayed)
    }

    fn flush_impl(&mut self, parent: &mut Session) -> Result<usize> {
        if !Arc::ptr_eq(&self.runtime, &parent.runtime) {
            return Err(GraphError::Internal {
                message: "child and parent sessions use different runtimes".to_string(),
            });
        }
        let entries = compact_entries(&self.tracker.all_entries());

        for entry in entries.iter().filter(|e| e.op == DiffOp::Created) {
            if parent.graph.lookup(&entry.id).is_some() {
                continue;
            }
            let (entity, preassigned) = match self.graph.lookup(&entry.id) {
                Some(handle) => {
                    let object = self.graph.get(handle)?;
                    (object.entity.clone(), object.preassigned.clone())
                }
                None => (entry.id.entity().to_string(), None),
            };
            parent.register_created(entry.id.clone(), &entity, preassigned)?;
        }

        for entry in &entries {
            let handle = parent.target_handle(&entry.id)?;
            match &entry.op {
                DiffOp::Created => {}
                DiffOp::Attribute { name, new, .. } => {
                    if parent.graph.get(handle)?.state() == PersistenceState::Deleted {
                        continue;
                    }
                    parent.ensure(handle, Need::Attributes)?;
                    parent.write_attribute(handle, name, new.clone())?;
                }
                DiffOp::Arc {
                    relationship,
                    target,
                    kind,
                    ..
                } => {
                    parent.ensure(handle, Need::Attributes)?;
                    if let Some(target) = target {
                        parent.target_handle(target)?;
                    }
                    let edit = match (kind, target) {
                        (ArcChangeKind::Set, _) => {
                            parent.ensure(handle, Need::Arc(relationship))?;
                            ArcEdit::Set(target.clone())
                        }
                        (ArcChangeKind::Add, Some(member)) => ArcEdit::Add(member.clone()),
                        (ArcChangeKind::Remove, Some(member)) => ArcEdit::Remove(member.clone()),
                        _ => continue,
                    };
                    parent.apply_arc_edit(handle, relationship, edit, true)?;
                }
                DiffOp::Deleted => {
                    let object = parent.graph.get(handle)?;
                    match object.state() {
                        PersistenceState::Deleted => {}
                        PersistenceState::New => {
                            parent.graph.unregister(handle)?;
                            parent.tracker.clear(&entry.id);
                        }
                        _ => {
                            parent.ensure(handle, Need::Attributes)?;
                            parent.graph.get_mut(handle)?.state = PersistenceState::Deleted;
                            parent.tracker.record_deleted(&entry.id);
                        }
                    }
                }
            }
        }

        for handle in self.graph.handles() {
            match self.graph.get(handle)?.state() {
                PersistenceState::New | PersistenceState::Modified => {
                    self.graph.get_mut(handle)?.state = PersistenceState::Committed;
                }
                PersistenceState::Deleted => {
                    self.graph.unregister(handle)?;
                }
                _ => {}
            }
        }
        self.tracker.clear_all();
        Ok(entries.len())
    }
}
