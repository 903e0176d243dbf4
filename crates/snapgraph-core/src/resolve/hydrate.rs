//! Turning fetched rows into registered objects

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::collab::SOURCE_KEY_PREFIX;
use crate::diff::{merge, ArcChangeKind, DiffOp};
use crate::errors::{GraphError, Result};
use crate::graph::{ArcValue, ObjectHandle, PersistenceState};
use crate::model::{ObjectId, Row, Value};
use crate::session::Session;
use crate::snapshot::Snapshot;

/// Copy of `row` without collaborator bookkeeping columns
pub(crate) fn storage_columns(row: &Row) -> Row {
    row.iter()
        .filter(|(column, _)| !column.starts_with(SOURCE_KEY_PREFIX))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

impl Session {
    /// Register fetched rows of `entity`, returning one handle per row
    ///
    /// Rows go through the snapshot store first. With `refresh_on_fetch`
    /// disabled an already cached snapshot wins over the fetched row.
    pub(crate) fn hydrate_rows(
        &mut self,
        entity: &str,
        rows: &[Row],
        group: Option<&str>,
    ) -> Result<Vec<ObjectHandle>> {
        let resolver = self.resolver();
        let refresh = self.runtime.config.refresh_on_fetch;

        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let values = storage_columns(row);
            let id = resolver.object_id_from_row(entity, &values)?;
            let concrete = resolver.entity_for_row(entity, &values).to_string();
            parsed.push((id, concrete, values));
        }

        let mut snapshots: Vec<Option<Arc<Snapshot>>> = vec![None; parsed.len()];
        let mut to_put = Vec::new();
        let mut positions = Vec::new();
        for (position, (id, _, values)) in parsed.iter().enumerate() {
            if !refresh {
                if let Some(cached) = self.store.get(id) {
                    snapshots[position] = Some(cached);
                    continue;
                }
            }
            to_put.push((id.clone(), values.clone()));
            positions.push(position);
        }
        let stored = self.store.put_rows(Some(&self.id), group, to_put);
        for (position, snapshot) in positions.into_iter().zip(stored) {
            snapshots[position] = Some(snapshot);
        }

        let mut handles = Vec::with_capacity(parsed.len());
        for ((id, concrete, _), snapshot) in parsed.into_iter().zip(snapshots) {
            let snapshot = snapshot.ok_or_else(|| GraphError::Internal {
                message: format!("no snapshot installed for {}", id),
            })?;
            handles.push(self.hydrate_object(id, &concrete, &snapshot)?);
        }
        Ok(handles)
    }

    /// Bring the object for `id` in line with a freshly observed snapshot
    ///
    /// HOLLOW and COMMITTED objects take the snapshot, MODIFIED objects merge
    /// it under their pending edits, NEW and DELETED objects are left alone.
    /// In a child session, objects the parent has pending state for come
    /// from the parent instead.
    pub(crate) fn hydrate_object(
        &mut self,
        id: ObjectId,
        concrete: &str,
        snapshot: &Snapshot,
    ) -> Result<ObjectHandle> {
        let (handle, _) = self
            .graph
            .get_or_create(id, concrete, PersistenceState::Hollow)?;
        let object = self.graph.get(handle)?;
        if self.mirrors_parent(&object.id) {
            // the parent's pending state wins over storage
            if object.state() == PersistenceState::Hollow {
                self.inherit_from_parent(handle)?;
            }
            return Ok(handle);
        }
        match object.state() {
            PersistenceState::Hollow => {
                self.refine_entity(handle, concrete)?;
                self.apply_snapshot(handle, snapshot)?;
            }
            PersistenceState::Committed => self.apply_snapshot(handle, snapshot)?,
            PersistenceState::Modified => self.merge_snapshot(handle, None, snapshot)?,
            PersistenceState::New | PersistenceState::Deleted | PersistenceState::Transient => {}
        }
        Ok(handle)
    }

    /// Narrow a HOLLOW object's entity once its row shows a subentity
    pub(crate) fn refine_entity(&mut self, handle: ObjectHandle, concrete: &str) -> Result<()> {
        let resolver = self.resolver();
        let object = self.graph.get_mut(handle)?;
        if object.entity != concrete && resolver.is_subentity_of(concrete, &object.entity) {
            object.entity = concrete.to_string();
        }
        Ok(())
    }

    /// Replace attribute values and the baseline with `snapshot`; the object
    /// becomes COMMITTED
    ///
    /// Resolved to-one arcs whose foreign key changed turn back into faults.
    pub(crate) fn apply_snapshot(&mut self, handle: ObjectHandle, snapshot: &Snapshot) -> Result<()> {
        let resolver = self.resolver();
        let entity = self.graph.get(handle)?.entity.clone();
        let attributes = resolver.attributes(&entity)?;
        let relationships = resolver.relationships(&entity)?;

        let mut stale = Vec::new();
        for rel in relationships.iter().filter(|r| r.is_to_one()) {
            let fetched = resolver.target_id(rel, &snapshot.values)?;
            if let Some(ArcValue::ToOne(current)) = self.graph.get(handle)?.arc(&rel.name) {
                if *current != fetched {
                    stale.push(rel.name.clone());
                }
            }
        }

        let object = self.graph.get_mut(handle)?;
        object.values = attributes
            .iter()
            .map(|a| {
                let value = snapshot.get(&a.column).cloned().unwrap_or(Value::Null);
                (a.name.clone(), value)
            })
            .collect();
        for name in stale {
            object.arcs.shift_remove(&name);
        }
        object.baseline = snapshot.values.clone();
        object.upstream = None;
        object.snapshot_version = Some(snapshot.version);
        object.state = PersistenceState::Committed;
        Ok(())
    }

    /// Three-way merge of an upstream snapshot into a MODIFIED object
    ///
    /// Pending attribute edits and pending relationship edits stay; every
    /// other attribute takes the upstream value. The lock baseline is kept
    /// so a later commit still detects the upstream change; the upstream row
    /// is kept next to it for resolving relationships.
    pub(crate) fn merge_snapshot(
        &mut self,
        handle: ObjectHandle,
        before: Option<&Row>,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let resolver = self.resolver();
        let object = self.graph.get(handle)?;
        let id = object.id.clone();
        let entity = object.entity.clone();
        let attributes = resolver.attributes(&entity)?;
        let relationships = resolver.relationships(&entity)?;

        let (pending_attributes, pending_arcs): (HashSet<String>, HashSet<String>) =
            match self.tracker.diff(&id) {
                Some(diff) => (
                    diff.net_attribute_changes().into_keys().collect(),
                    diff.entries()
                        .iter()
                        .filter_map(|e| e.op.relationship().map(str::to_string))
                        .collect(),
                ),
                None => Default::default(),
            };

        let mut pending = Row::new();
        for attribute in &attributes {
            if pending_attributes.contains(&attribute.name) {
                let value = object
                    .value(&attribute.name)
                    .cloned()
                    .unwrap_or(Value::Null);
                pending.insert(attribute.column.clone(), value);
            }
        }
        let base = before.unwrap_or(object.current_row()).clone();
        let outcome = merge(Some(&base), &snapshot.values, &pending);

        let mut stale = Vec::new();
        for rel in relationships.iter().filter(|r| r.is_to_one()) {
            if pending_arcs.contains(&rel.name) {
                continue;
            }
            let fetched = resolver.target_id(rel, &snapshot.values)?;
            if let Some(ArcValue::ToOne(current)) = object.arc(&rel.name) {
                if *current != fetched {
                    stale.push(rel.name.clone());
                }
            }
        }

        let object = self.graph.get_mut(handle)?;
        for attribute in &attributes {
            if !pending.contains_key(&attribute.column) {
                let value = outcome
                    .values
                    .get(&attribute.column)
                    .cloned()
                    .unwrap_or(Value::Null);
                object.values.insert(attribute.name.clone(), value);
            }
        }
        for name in stale {
            object.arcs.shift_remove(&name);
        }
        object.upstream = Some(snapshot.values.clone());
        object.snapshot_version = Some(snapshot.version);

        if !outcome.conflicts.is_empty() {
            debug!(
                component = module_path!(),
                session_id = %self.id,
                object_id = %id,
                conflicts = ?outcome.conflicts,
                "upstream change overlaps pending edits; keeping local values"
            );
        }
        Ok(())
    }

    /// Install a fetched arc value, then replay pending edits of that arc
    pub(crate) fn attach_arc(
        &mut self,
        handle: ObjectHandle,
        relationship: &str,
        fetched: ArcValue,
    ) -> Result<()> {
        let id = self.graph.get(handle)?.id.clone();
        let mut value = fetched;
        // a parent's pending edits first, then this session's own
        if let Some(view) = &self.parent_view {
            for op in view.arc_ops(&id, relationship) {
                replay_arc_op(&mut value, op);
            }
        }
        if let Some(diff) = self.tracker.diff(&id) {
            for op in diff.arc_ops(relationship) {
                replay_arc_op(&mut value, op);
            }
        }
        self.graph
            .get_mut(handle)?
            .arcs
            .insert(relationship.to_string(), value);
        Ok(())
    }
}

fn replay_arc_op(value: &mut ArcValue, op: &DiffOp) {
    let DiffOp::Arc { target, kind, .. } = op else {
        return;
    };
    match (value, kind, target) {
        (ArcValue::ToOne(current), ArcChangeKind::Set, _) => {
            *current = target.clone();
        }
        (ArcValue::ToMany(members), ArcChangeKind::Add, Some(t)) => {
            if !members.contains(t) {
                members.push(t.clone());
            }
        }
        (ArcValue::ToMany(members), ArcChangeKind::Remove, Some(t)) => {
            members.retain(|m| m != t);
        }
        _ => {}
    }
}
