//! Relationship edits and deletion
//!
//! The foreign key always lives on the to-one side. Editing either end of a
//! to-one/to-many pair is routed through the to-one side, which records the
//! change that commit turns into a foreign key write; the to-many side
//! records add/remove entries so a later fault resolution can replay them.
//! Flattened relationships record add/remove on the side that was edited
//! and update the reverse side in memory only.

use crate::diff::ArcChangeKind;
use crate::errors::{GraphError, Result};
use crate::graph::{ArcValue, ObjectHandle, PersistenceState};
use crate::model::{DeleteRule, ObjectId, Relationship};
use crate::resolve::Need;
use crate::session::Session;

/// One change to one relationship of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ArcEdit {
    Set(Option<ObjectId>),
    Add(ObjectId),
    Remove(ObjectId),
}

impl Session {
    /// Apply `edit` to the in-memory arc when it is resolved and, when
    /// `record` is set, log it and mark the object modified
    pub(crate) fn apply_arc_edit(
        &mut self,
        handle: ObjectHandle,
        relationship: &str,
        edit: ArcEdit,
        record: bool,
    ) -> Result<()> {
        let object = self.graph.get_mut(handle)?;
        let id = object.id.clone();
        let arc = object.arcs.get_mut(relationship);
        let (target, previous, kind) = match edit {
            ArcEdit::Set(target) => {
                let previous = match arc {
                    Some(ArcValue::ToOne(current)) => std::mem::replace(current, target.clone()),
                    _ => None,
                };
                (target, previous, ArcChangeKind::Set)
            }
            ArcEdit::Add(member) => {
                if let Some(ArcValue::ToMany(members)) = arc {
                    if !members.contains(&member) {
                        members.push(member.clone());
                    }
                }
                (Some(member), None, ArcChangeKind::Add)
            }
            ArcEdit::Remove(member) => {
                if let Some(ArcValue::ToMany(members)) = arc {
                    members.retain(|m| *m != member);
                }
                (Some(member), None, ArcChangeKind::Remove)
            }
        };
        if record {
            self.tracker
                .record_arc_change(&id, relationship, target, previous, kind);
            self.mark_modified(handle)?;
        }
        Ok(())
    }

    fn check_target_type(&self, rel: &Relationship, target: ObjectHandle) -> Result<ObjectId> {
        let object = self.graph.get(target)?;
        if !self.resolver().is_subentity_of(&object.entity, &rel.target) {
            return Err(GraphError::InvalidMapping {
                reason: format!(
                    "{} expects {} but got {}",
                    rel.name, rel.target, object.entity
                ),
            });
        }
        Ok(object.id.clone())
    }

    /// Point a to-one relationship at `target` (or clear it)
    ///
    /// The reverse relationship of the old and the new target is kept in
    /// step.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProperty` for unmapped relationships, `InvalidMapping`
    /// when the relationship is not to-one or the target has the wrong
    /// entity and `IllegalStateTransition` on DELETED objects.
    pub fn set_related(
        &mut self,
        source: ObjectHandle,
        relationship: &str,
        target: Option<ObjectHandle>,
    ) -> Result<()> {
        self.process_events();
        self.check_editable(source, "set_related")?;
        let resolver = self.resolver();
        let entity = self.graph.get(source)?.entity.clone();
        let rel = resolver.relationship(&entity, relationship)?.clone();
        if !rel.is_to_one() {
            return Err(GraphError::InvalidMapping {
                reason: format!("{} is not a to-one relationship", relationship),
            });
        }
        let target_id = match target {
            Some(target) => Some(self.check_target_type(&rel, target)?),
            None => None,
        };
        self.link_to_one(source, &rel, target_id)
    }

    /// Add `target` to a to-many relationship
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` when the relationship is not to-many or the
    /// target has the wrong entity and `IllegalStateTransition` on DELETED
    /// objects.
    pub fn add_related(
        &mut self,
        source: ObjectHandle,
        relationship: &str,
        target: ObjectHandle,
    ) -> Result<()> {
        self.process_events();
        let (rel, target_id) = self.to_many_edit(source, relationship, target, "add_related")?;
        let resolver = self.resolver();
        let source_id = self.graph.get(source)?.id.clone();

        if rel.is_flattened() {
            if self.arc_contains(source, relationship, &target_id)? {
                return Ok(());
            }
            self.apply_arc_edit(source, relationship, ArcEdit::Add(target_id), true)?;
            if let Some(reverse) = resolver.reverse_of(&rel)? {
                self.apply_arc_edit(target, &reverse.name, ArcEdit::Add(source_id), false)?;
            }
            return Ok(());
        }

        let reverse = self.owning_side(&rel)?;
        self.link_to_one(target, &reverse, Some(source_id))
    }

    /// Remove `target` from a to-many relationship
    ///
    /// # Errors
    ///
    /// Same as [`Session::add_related`].
    pub fn remove_related(
        &mut self,
        source: ObjectHandle,
        relationship: &str,
        target: ObjectHandle,
    ) -> Result<()> {
        self.process_events();
        let (rel, target_id) =
            self.to_many_edit(source, relationship, target, "remove_related")?;
        let resolver = self.resolver();
        let source_id = self.graph.get(source)?.id.clone();

        if rel.is_flattened() {
            self.apply_arc_edit(source, relationship, ArcEdit::Remove(target_id), true)?;
            if let Some(reverse) = resolver.reverse_of(&rel)? {
                self.apply_arc_edit(target, &reverse.name, ArcEdit::Remove(source_id), false)?;
            }
            return Ok(());
        }

        let reverse = self.owning_side(&rel)?;
        self.ensure(target, Need::Arc(&reverse.name))?;
        let owner = match self.graph.get(target)?.arc(&reverse.name) {
            Some(ArcValue::ToOne(owner)) => owner.clone(),
            _ => None,
        };
        if owner.as_ref() != Some(&source_id) {
            return Ok(());
        }
        self.link_to_one(target, &reverse, None)
    }

    fn to_many_edit(
        &self,
        source: ObjectHandle,
        relationship: &str,
        target: ObjectHandle,
        op: &str,
    ) -> Result<(Relationship, ObjectId)> {
        self.check_editable(source, op)?;
        self.check_editable(target, op)?;
        let entity = self.graph.get(source)?.entity.clone();
        let rel = self.resolver().relationship(&entity, relationship)?.clone();
        if rel.is_to_one() {
            return Err(GraphError::InvalidMapping {
                reason: format!("{} is not a to-many relationship", relationship),
            });
        }
        let target_id = self.check_target_type(&rel, target)?;
        Ok((rel, target_id))
    }

    /// The to-one relationship holding the foreign key of a to-many
    fn owning_side(&self, rel: &Relationship) -> Result<Relationship> {
        self.resolver()
            .reverse_of(rel)?
            .filter(|r| r.is_to_one())
            .cloned()
            .ok_or_else(|| GraphError::InvalidMapping {
                reason: format!("{} has no to-one reverse", rel.name),
            })
    }

    fn arc_contains(&self, handle: ObjectHandle, relationship: &str, id: &ObjectId) -> Result<bool> {
        Ok(self
            .graph
            .get(handle)?
            .arc(relationship)
            .is_some_and(|arc| arc.contains(id)))
    }

    /// Set a to-one arc and mirror the change on its reverse
    fn link_to_one(
        &mut self,
        source: ObjectHandle,
        rel: &Relationship,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let resolver = self.resolver();
        self.ensure(source, Need::Arc(&rel.name))?;
        let object = self.graph.get(source)?;
        let source_id = object.id.clone();
        let previous = match object.arc(&rel.name) {
            Some(ArcValue::ToOne(previous)) => previous.clone(),
            _ => None,
        };
        if previous == target {
            return Ok(());
        }
        self.apply_arc_edit(source, &rel.name, ArcEdit::Set(target.clone()), true)?;

        let Some(reverse) = resolver.reverse_of(rel)? else {
            return Ok(());
        };
        if let Some(previous) = previous {
            let handle = self.target_handle(&previous)?;
            if reverse.is_to_one() {
                if self.arc_contains(handle, &reverse.name, &source_id)? {
                    self.apply_arc_edit(handle, &reverse.name, ArcEdit::Set(None), false)?;
                }
            } else {
                self.apply_arc_edit(
                    handle,
                    &reverse.name,
                    ArcEdit::Remove(source_id.clone()),
                    true,
                )?;
            }
        }
        if let Some(target) = target {
            let handle = self.target_handle(&target)?;
            let edit = if reverse.is_to_one() {
                ArcEdit::Set(Some(source_id))
            } else {
                ArcEdit::Add(source_id)
            };
            self.apply_arc_edit(handle, &reverse.name, edit, !reverse.is_to_one())?;
        }
        Ok(())
    }

    /// Target of a to-one relationship; may fetch
    ///
    /// # Errors
    ///
    /// Returns `FaultResolutionFailure` when the source row is gone.
    pub fn related_one(
        &mut self,
        handle: ObjectHandle,
        relationship: &str,
    ) -> Result<Option<ObjectHandle>> {
        self.process_events();
        self.ensure(handle, Need::Arc(relationship))?;
        match self.graph.get(handle)?.arc(relationship) {
            Some(ArcValue::ToOne(Some(target))) => {
                let target = target.clone();
                self.target_handle(&target).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Members of a to-many relationship in fetch order; may fetch
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the row source fails.
    pub fn related_many(
        &mut self,
        handle: ObjectHandle,
        relationship: &str,
    ) -> Result<Vec<ObjectHandle>> {
        self.process_events();
        self.ensure(handle, Need::Arc(relationship))?;
        let members = match self.graph.get(handle)?.arc(relationship) {
            Some(arc) => arc.targets(),
            None => Vec::new(),
        };
        members.iter().map(|id| self.target_handle(id)).collect()
    }

    /// Whether the relationship is resolved, without fetching
    ///
    /// # Errors
    ///
    /// Returns `UnknownProperty` for unmapped relationships.
    pub fn is_arc_resolved(&self, handle: ObjectHandle, relationship: &str) -> Result<bool> {
        let object = self.graph.get(handle)?;
        self.resolver().relationship(&object.entity, relationship)?;
        Ok(object.arc(relationship).is_some_and(|arc| !arc.is_fault()))
    }

    /// Mark an object (and whatever its cascade rules reach) for deletion
    ///
    /// `Deny` rules are checked before anything changes. `Nullify` rules
    /// clear the foreign keys or join rows pointing at deleted objects.
    /// A NEW object is removed from the session right away.
    ///
    /// # Errors
    ///
    /// Returns `DeleteDenied` when a `Deny` relationship still has related
    /// objects and `FaultResolutionFailure` when a row to inspect is gone.
    pub fn delete_object(&mut self, handle: ObjectHandle) -> Result<()> {
        self.process_events();
        if self.graph.get(handle)?.state() == PersistenceState::Deleted {
            return Ok(());
        }
        let mut plan = Vec::new();
        self.collect_cascade(handle, &mut plan)?;
        for candidate in &plan {
            self.check_deny(*candidate, &plan)?;
        }
        for candidate in plan {
            self.apply_delete(candidate)?;
        }
        Ok(())
    }

    fn collect_cascade(&mut self, handle: ObjectHandle, plan: &mut Vec<ObjectHandle>) -> Result<()> {
        if plan.contains(&handle) {
            return Ok(());
        }
        self.ensure(handle, Need::Attributes)?;
        plan.push(handle);
        let entity = self.graph.get(handle)?.entity.clone();
        let relationships: Vec<Relationship> = self
            .resolver()
            .relationships(&entity)?
            .into_iter()
            .filter(|r| r.delete_rule == DeleteRule::Cascade && !r.is_flattened())
            .cloned()
            .collect();
        for rel in relationships {
            self.ensure(handle, Need::Arc(&rel.name))?;
            let targets = self.arc_targets(handle, &rel.name)?;
            for target in targets {
                let target = self.target_handle(&target)?;
                if self.graph.get(target)?.state() != PersistenceState::Deleted {
                    self.collect_cascade(target, plan)?;
                }
            }
        }
        Ok(())
    }

    fn check_deny(&mut self, handle: ObjectHandle, plan: &[ObjectHandle]) -> Result<()> {
        let entity = self.graph.get(handle)?.entity.clone();
        let relationships: Vec<Relationship> = self
            .resolver()
            .relationships(&entity)?
            .into_iter()
            .filter(|r| r.delete_rule == DeleteRule::Deny)
            .cloned()
            .collect();
        for rel in relationships {
            self.ensure(handle, Need::Arc(&rel.name))?;
            for target in self.arc_targets(handle, &rel.name)? {
                let target = self.target_handle(&target)?;
                let live = self.graph.get(target)?.state() != PersistenceState::Deleted;
                if live && !plan.contains(&target) {
                    return Err(GraphError::DeleteDenied {
                        object_id: self.graph.get(handle)?.id.to_string(),
                        relationship: rel.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn arc_targets(&self, handle: ObjectHandle, relationship: &str) -> Result<Vec<ObjectId>> {
        Ok(self
            .graph
            .get(handle)?
            .arc(relationship)
            .map(ArcValue::targets)
            .unwrap_or_default())
    }

    fn apply_delete(&mut self, handle: ObjectHandle) -> Result<()> {
        let resolver = self.resolver();
        let object = self.graph.get(handle)?;
        if object.state() == PersistenceState::Deleted {
            return Ok(());
        }
        let id = object.id.clone();
        let entity = object.entity.clone();
        let was_new = object.state() == PersistenceState::New;
        let relationships: Vec<Relationship> = resolver
            .relationships(&entity)?
            .into_iter()
            .cloned()
            .collect();

        for rel in &relationships {
            let nullify = rel.delete_rule == DeleteRule::Nullify;
            if rel.is_flattened() {
                // join rows never outlive their source
                self.ensure(handle, Need::Arc(&rel.name))?;
                for target in self.arc_targets(handle, &rel.name)? {
                    self.apply_arc_edit(handle, &rel.name, ArcEdit::Remove(target.clone()), true)?;
                    if let Some(reverse) = resolver.reverse_of(rel)? {
                        let target = self.target_handle(&target)?;
                        self.apply_arc_edit(target, &reverse.name, ArcEdit::Remove(id.clone()), false)?;
                    }
                }
            } else if rel.is_to_many() && nullify {
                let reverse = self.owning_side(rel)?;
                self.ensure(handle, Need::Arc(&rel.name))?;
                for target in self.arc_targets(handle, &rel.name)? {
                    let target = self.target_handle(&target)?;
                    if self.graph.get(target)?.state() != PersistenceState::Deleted {
                        self.link_to_one(target, &reverse, None)?;
                    }
                }
            } else if rel.is_to_one() && (nullify || was_new) {
                self.link_to_one(handle, rel, None)?;
            }
        }

        if was_new {
            self.graph.unregister(handle)?;
            self.tracker.clear(&id);
            return Ok(());
        }
        self.graph.get_mut(handle)?.state = PersistenceState::Deleted;
        self.tracker.record_deleted(&id);
        Ok(())
    }
}
