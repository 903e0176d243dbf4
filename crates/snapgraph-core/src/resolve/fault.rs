//! On-demand resolution of HOLLOW objects and relationship faults
//!
//! Every hidden fetch goes through [`Session::ensure`]. It checks the
//! object's state first, so each need triggers at most one fetch per object
//! until the object is invalidated again.

use std::time::Instant;

use indexmap::IndexSet;

use crate::collab::{Query, Qualifier, RelatedQuery, SelectQuery};
use crate::errors::{GraphError, Result};
use crate::graph::{ArcValue, ObjectHandle, PersistenceState};
use crate::model::{ObjectId, Row};
use crate::session::{Inherited, Session};
use crate::{log_op_end, log_op_error, log_op_start};

/// What a caller is about to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Need<'a> {
    Attributes,
    Arc(&'a str),
}

impl Session {
    /// Resolve whatever `need` requires, fetching if necessary
    ///
    /// # Errors
    ///
    /// Returns `FaultResolutionFailure` when the backing row no longer
    /// exists or a parent session deleted it; the object stays HOLLOW.
    pub(crate) fn ensure(&mut self, handle: ObjectHandle, need: Need<'_>) -> Result<()> {
        match need {
            Need::Attributes => self.ensure_attributes(handle),
            Need::Arc(relationship) => self.ensure_arc(handle, relationship),
        }
    }

    fn ensure_attributes(&mut self, handle: ObjectHandle) -> Result<()> {
        let object = self.graph.get(handle)?;
        if object.state() != PersistenceState::Hollow {
            return Ok(());
        }
        let id = object.id.clone();
        let entity = object.entity.clone();

        match self.inherit_from_parent(handle)? {
            Inherited::Seeded => return Ok(()),
            Inherited::Deleted => {
                return Err(GraphError::FaultResolutionFailure {
                    object_id: id.to_string(),
                    reason: "deleted in the parent session".to_string(),
                })
            }
            Inherited::Absent => {}
        }

        if let Some(snapshot) = self.store.get(&id) {
            let concrete = self.resolver().entity_for_row(&entity, &snapshot.values).to_string();
            self.refine_entity(handle, &concrete)?;
            return self.apply_snapshot(handle, &snapshot);
        }

        log_op_start!("resolve_fault", session_id = %self.id, object_id = %id);
        let start = Instant::now();

        let result = match self.fetch_row(&entity, &id) {
            Ok(Some(row)) => self.hydrate_rows(&entity, &[row], None).map(|_| ()),
            Ok(None) => Err(GraphError::FaultResolutionFailure {
                object_id: id.to_string(),
                reason: "no matching row in storage".to_string(),
            }),
            Err(err) => Err(err),
        };
        result.map_err(|e| {
            log_op_error!(
                "resolve_fault",
                e.clone(),
                session_id = &self.id,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "resolve_fault",
            duration_ms = start.elapsed().as_millis() as u64,
            object_id = %id
        );
        Ok(())
    }

    /// Fetch the current row of `id` without registering anything
    pub(crate) fn fetch_row(&self, entity: &str, id: &ObjectId) -> Result<Option<Row>> {
        let resolver = self.resolver();
        let Some(key) = id.key_values() else {
            return Ok(None);
        };
        let mut qualifier = resolver.entity_qualifier(entity)?;
        for (column, value) in key {
            qualifier = qualifier.and(Qualifier::equals(column.clone(), value.clone()));
        }
        let mut query = SelectQuery::new(entity);
        query.qualifier = qualifier;
        query.limit = Some(1);
        let rows = self.runtime.source.fetch(&Query::Select(query))?;
        Ok(rows.into_iter().next())
    }

    fn ensure_arc(&mut self, handle: ObjectHandle, relationship: &str) -> Result<()> {
        let resolver = self.resolver();
        let object = self.graph.get(handle)?;
        let rel = resolver.relationship(&object.entity, relationship)?;
        if object.arc(relationship).is_some_and(|arc| !arc.is_fault()) {
            return Ok(());
        }

        // any relationship read resolves a HOLLOW object first
        self.ensure_attributes(handle)?;
        let object = self.graph.get(handle)?;
        if object.arc(relationship).is_some_and(|arc| !arc.is_fault()) {
            return Ok(());
        }
        let fetched = if rel.is_to_one() {
            let target = resolver.target_id(rel, object.current_row())?;
            if let Some(target) = &target {
                self.graph
                    .get_or_create(target.clone(), &rel.target, PersistenceState::Hollow)?;
            }
            ArcValue::ToOne(target)
        } else {
            let source = object.id.clone();
            let source_entity = object.entity.clone();
            if source.is_temporary() {
                ArcValue::ToMany(Vec::new())
            } else {
                let query = Query::Related(RelatedQuery {
                    source_entity,
                    relationship: relationship.to_string(),
                    source_ids: vec![source],
                });
                let rows = self.runtime.source.fetch(&query)?;
                let handles = self.hydrate_rows(&rel.target, &rows, None)?;
                let mut members: IndexSet<ObjectId> = IndexSet::with_capacity(handles.len());
                for target in handles {
                    members.insert(self.graph.get(target)?.id.clone());
                }
                ArcValue::ToMany(members.into_iter().collect())
            }
        };
        self.attach_arc(handle, relationship, fetched)
    }

    /// Handle of an arc target, registering a HOLLOW object if needed
    pub(crate) fn target_handle(&mut self, id: &ObjectId) -> Result<ObjectHandle> {
        if let Some(handle) = self.graph.lookup(id) {
            return Ok(handle);
        }
        let (handle, _) = self
            .graph
            .get_or_create(id.clone(), id.entity(), PersistenceState::Hollow)?;
        Ok(handle)
    }
}
