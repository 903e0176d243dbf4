use std::collections::HashMap;
use std::time::Instant;

use snapgraph_core_types::CommitId;
use tracing::warn;

use super::plan::dependency_order;
use super::CommitSummary;
use crate::collab::{StorageError, WriteBatch, WriteOp, WriteTransaction};
use crate::diff::{compact_entries, ArcChangeKind, DiffOp};
use crate::errors::{GraphError, LockFailure, Result};
use crate::graph::{ArcValue, ObjectHandle, ObjectView, PersistenceState};
use crate::model::{DeleteRule, ObjectId, Relationship, RelationshipKind, Row, Value};
use crate::policy::ValidationPhase;
use crate::session::Session;
use crate::snapshot::{SnapshotChanges, SnapshotUpdate};
use crate::{log_op_end, log_op_error, log_op_start};

fn commit_failure(err: StorageError) -> GraphError {
    GraphError::CommitFailure {
        message: err.to_string(),
    }
}

/// Flattened relationship change, written as a join row
struct JoinChange {
    source: ObjectId,
    target: ObjectId,
    rel: Relationship,
    insert: bool,
}

struct CommitPlan {
    inserts: Vec<ObjectHandle>,
    /// MODIFIED objects with columns to write
    updates: Vec<ObjectHandle>,
    /// MODIFIED objects whose changes are all phantom
    touched: Vec<ObjectHandle>,
    deletes: Vec<ObjectHandle>,
    joins: Vec<JoinChange>,
    /// Sources of to-many changes, reported to peers
    indirect: Vec<ObjectId>,
}

impl CommitPlan {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.joins.is_empty()
    }
}

#[derive(Default)]
struct WriteOutcome {
    /// Handle, permanent identity and full inserted row
    inserted: Vec<(ObjectHandle, ObjectId, Row)>,
    /// Handle and written columns
    updated: Vec<(ObjectHandle, Row)>,
    join_rows: usize,
    /// Temporary identity to the permanent one it was inserted under
    assigned: HashMap<ObjectId, ObjectId>,
}

impl WriteOutcome {
    /// Permanent form of `id`, `None` for a temporary id never inserted
    fn permanent(&self, id: &ObjectId) -> Option<ObjectId> {
        if id.is_temporary() {
            self.assigned.get(id).cloned()
        } else {
            Some(id.clone())
        }
    }
}

/// Write the foreign key columns of a to-one relationship into `values`
fn write_foreign_key(
    values: &mut Row,
    rel: &Relationship,
    target: Option<&ObjectId>,
    outcome: &WriteOutcome,
) -> Result<()> {
    let RelationshipKind::ToOne { joins } = &rel.kind else {
        return Ok(());
    };
    let target = match target {
        Some(target) => Some(outcome.permanent(target).ok_or_else(|| {
            GraphError::CommitFailure {
                message: format!("{} references {} which has no key yet", rel.name, target),
            }
        })?),
        None => None,
    };
    for join in joins {
        let value = target
            .as_ref()
            .and_then(|t| t.key_value(&join.target_column))
            .cloned()
            .unwrap_or(Value::Null);
        values.insert(join.source_column.clone(), value);
    }
    Ok(())
}

impl Session {
    /// Write every pending change to storage as one unit
    ///
    /// When no row needs writing (only phantom changes, or none at all)
    /// storage is not contacted and the summary reports `phantom`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationFailure` or `DeleteDenied` before anything is
    /// written, `OptimisticLockFailure` listing every conflicting identity,
    /// and `CommitFailure` when storage rejects the writes. In all of these
    /// cases the session keeps its pending changes.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        self.process_events();
        let commit_id = CommitId::new();
        log_op_start!("commit", session_id = %self.id, commit_id = %commit_id);
        let start = Instant::now();

        let summary = self.commit_impl(commit_id).map_err(|e| {
            log_op_error!(
                "commit",
                e.clone(),
                session_id = &self.id,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "commit",
            duration_ms = start.elapsed().as_millis() as u64,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            phantom = summary.phantom
        );
        Ok(summary)
    }

    fn commit_impl(&mut self, commit_id: CommitId) -> Result<CommitSummary> {
        let new = self.graph.handles_in_state(PersistenceState::New);
        let modified = self.graph.handles_in_state(PersistenceState::Modified);
        let deleted = self.graph.handles_in_state(PersistenceState::Deleted);

        self.validate(&new, &modified, &deleted)?;
        let plan = self.plan(&new, &modified, &deleted)?;
        self.check_locks(&plan)?;

        if plan.is_empty() {
            for handle in &plan.touched {
                self.graph.get_mut(*handle)?.state = PersistenceState::Committed;
            }
            self.tracker.clear_all();
            return Ok(CommitSummary {
                commit_id,
                inserted: 0,
                updated: 0,
                deleted: 0,
                join_rows: 0,
                phantom: true,
            });
        }

        let mut tx = self.runtime.sink.begin().map_err(commit_failure)?;
        let outcome = match self.write_through(tx.as_mut(), &plan) {
            Ok(outcome) => outcome,
            Err(err) => {
                tx.rollback();
                return Err(err);
            }
        };
        tx.commit().map_err(commit_failure)?;

        self.publish(plan, outcome, commit_id)
    }

    fn validate(
        &self,
        new: &[ObjectHandle],
        modified: &[ObjectHandle],
        deleted: &[ObjectHandle],
    ) -> Result<()> {
        let resolver = self.resolver();
        let hook = &self.runtime.hook;
        let phases = [
            (new, ValidationPhase::PreInsert),
            (modified, ValidationPhase::PreUpdate),
            (deleted, ValidationPhase::PreDelete),
        ];
        for (handles, phase) in phases {
            for handle in handles {
                let object = self.graph.get(*handle)?;
                let needed = self
                    .tracker
                    .diff(&object.id)
                    .map_or(true, |d| d.needs_validation());
                if needed {
                    hook.validate(&ObjectView::new(object), phase)
                        .map_err(|message| GraphError::ValidationFailure {
                            object_id: object.id.to_string(),
                            phase,
                            message,
                        })?;
                }

                for rel in resolver.relationships(&object.entity)? {
                    let Some(arc) = object.arc(&rel.name) else {
                        continue;
                    };
                    for target in arc.targets() {
                        let target_deleted = self
                            .graph
                            .lookup(&target)
                            .and_then(|h| self.graph.get(h).ok())
                            .is_some_and(|t| t.state() == PersistenceState::Deleted);
                        if phase == ValidationPhase::PreDelete {
                            if rel.delete_rule == DeleteRule::Deny && !target_deleted {
                                return Err(GraphError::DeleteDenied {
                                    object_id: object.id.to_string(),
                                    relationship: rel.name.clone(),
                                });
                            }
                        } else if rel.is_to_one() && target_deleted {
                            return Err(GraphError::ValidationFailure {
                                object_id: object.id.to_string(),
                                phase,
                                message: format!("{} points at deleted {}", rel.name, target),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// To-one relationships whose target differs from the stored foreign key
    fn pending_foreign_keys(
        &self,
        handle: ObjectHandle,
    ) -> Result<Vec<(Relationship, Option<ObjectId>)>> {
        let resolver = self.resolver();
        let object = self.graph.get(handle)?;
        let Some(diff) = self.tracker.diff(&object.id) else {
            return Ok(Vec::new());
        };
        let mut changed = Vec::new();
        for rel in resolver.relationships(&object.entity)? {
            if !rel.is_to_one() || diff.arc_ops(&rel.name).next().is_none() {
                continue;
            }
            let Some(ArcValue::ToOne(current)) = object.arc(&rel.name) else {
                continue;
            };
            if *current != resolver.target_id(rel, &object.baseline)? {
                changed.push((rel.clone(), current.clone()));
            }
        }
        Ok(changed)
    }

    /// Attributes whose value differs from the one before this unit of work
    fn pending_attributes(&self, handle: ObjectHandle) -> Result<Vec<String>> {
        let object = self.graph.get(handle)?;
        Ok(self
            .tracker
            .diff(&object.id)
            .map(|d| {
                d.net_attribute_changes()
                    .into_iter()
                    .filter(|(_, (old, new))| old != new)
                    .map(|(name, _)| name)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn plan(
        &self,
        new: &[ObjectHandle],
        modified: &[ObjectHandle],
        deleted: &[ObjectHandle],
    ) -> Result<CommitPlan> {
        let resolver = self.resolver();

        let mut insert_nodes = Vec::with_capacity(new.len());
        for handle in new {
            let object = self.graph.get(*handle)?;
            let mut depends_on = Vec::new();
            for rel in resolver.relationships(&object.entity)? {
                if let (true, Some(ArcValue::ToOne(Some(target)))) =
                    (rel.is_to_one(), object.arc(&rel.name))
                {
                    depends_on.extend(self.graph.lookup(target));
                }
            }
            insert_nodes.push((*handle, depends_on));
        }

        let mut delete_nodes = Vec::with_capacity(deleted.len());
        for handle in deleted {
            let object = self.graph.get(*handle)?;
            let mut depends_on = Vec::new();
            for rel in resolver.relationships(&object.entity)? {
                if rel.is_to_one() {
                    if let Some(target) = resolver.target_id(rel, &object.baseline)? {
                        depends_on.extend(self.graph.lookup(&target));
                    }
                }
            }
            delete_nodes.push((*handle, depends_on));
        }
        let mut deletes = dependency_order(&delete_nodes);
        deletes.reverse();

        let mut updates = Vec::new();
        let mut touched = Vec::new();
        for handle in modified {
            let writes = !self.pending_attributes(*handle)?.is_empty()
                || !self.pending_foreign_keys(*handle)?.is_empty();
            if writes {
                updates.push(*handle);
            } else {
                touched.push(*handle);
            }
        }

        let mut joins = Vec::new();
        let mut indirect: Vec<ObjectId> = Vec::new();
        for entry in compact_entries(&self.tracker.all_entries()) {
            let DiffOp::Arc {
                relationship,
                target: Some(target),
                kind,
                ..
            } = &entry.op
            else {
                continue;
            };
            let entity = match self.graph.lookup(&entry.id) {
                Some(handle) => self.graph.get(handle)?.entity.clone(),
                None => entry.id.entity().to_string(),
            };
            let rel = resolver.relationship(&entity, relationship)?;
            if rel.is_to_one() {
                continue;
            }
            if !indirect.contains(&entry.id) {
                indirect.push(entry.id.clone());
            }
            if rel.is_flattened() {
                joins.push(JoinChange {
                    source: entry.id.clone(),
                    target: target.clone(),
                    rel: rel.clone(),
                    insert: *kind == ArcChangeKind::Add,
                });
            }
        }

        Ok(CommitPlan {
            inserts: dependency_order(&insert_nodes),
            updates,
            touched,
            deletes,
            joins,
            indirect,
        })
    }

    /// Compare lock columns of the cached snapshots with the captured
    /// baselines before anything is written
    fn check_locks(&self, plan: &CommitPlan) -> Result<()> {
        let resolver = self.resolver();
        let mut failures = Vec::new();
        for handle in plan.updates.iter().chain(&plan.deletes) {
            let object = self.graph.get(*handle)?;
            let columns = resolver.locking_columns(&object.entity)?;
            if columns.is_empty() {
                continue;
            }
            let Some(snapshot) = self.store.get(&object.id) else {
                continue;
            };
            let stale = columns.iter().any(|c| {
                snapshot.get(c).unwrap_or(&Value::Null) != object.baseline.get(c).unwrap_or(&Value::Null)
            });
            if stale {
                failures.push(LockFailure {
                    object_id: object.id.clone(),
                    fresh_snapshot: Some(snapshot.values.clone()),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GraphError::OptimisticLockFailure { failures })
        }
    }

    /// Key and lock columns an update or delete must still match
    fn lock_qualifier(&self, handle: ObjectHandle) -> Result<(Row, bool)> {
        let object = self.graph.get(handle)?;
        let mut qualifier = Row::new();
        if let Some(key) = object.id.key_values() {
            for (column, value) in key {
                qualifier.insert(column.clone(), value.clone());
            }
        }
        let columns = self.resolver().locking_columns(&object.entity)?;
        for column in &columns {
            let value = object.baseline.get(column).cloned().unwrap_or(Value::Null);
            qualifier.insert(column.clone(), value);
        }
        Ok((qualifier, !columns.is_empty()))
    }

    fn lock_failure(&self, handle: ObjectHandle) -> Result<LockFailure> {
        let object = self.graph.get(handle)?;
        Ok(LockFailure {
            object_id: object.id.clone(),
            fresh_snapshot: self.fetch_row(&object.entity, &object.id)?,
        })
    }

    fn write_through(
        &self,
        tx: &mut dyn WriteTransaction,
        plan: &CommitPlan,
    ) -> Result<WriteOutcome> {
        let resolver = self.resolver();
        let mut outcome = WriteOutcome::default();
        let mut failures = Vec::new();

        for handle in &plan.inserts {
            let object = self.graph.get(*handle)?;
            let entity = object.entity.clone();
            let mut values = Row::new();
            for attribute in resolver.attributes(&entity)? {
                let value = object.value(&attribute.name).cloned().unwrap_or(Value::Null);
                values.insert(attribute.column.clone(), value);
            }
            values.extend(resolver.discriminator_values(&entity)?);
            for rel in resolver.relationships(&entity)? {
                if !rel.is_to_one() {
                    continue;
                }
                let target = match object.arc(&rel.name) {
                    Some(ArcValue::ToOne(target)) => target.clone(),
                    _ => resolver.target_id(rel, object.current_row())?,
                };
                write_foreign_key(&mut values, rel, target.as_ref(), &outcome)?;
            }
            let known = object
                .preassigned
                .as_ref()
                .or((!object.id.is_temporary()).then_some(&object.id));
            if let Some(key) = known.and_then(ObjectId::key_values) {
                for (column, value) in key {
                    values.insert(column.clone(), value.clone());
                }
            }

            let key_known = resolver
                .pk_columns(&entity)?
                .iter()
                .all(|c| values.get(c).is_some_and(|v| !v.is_null()));
            if !key_known && !resolver.generates_key(&entity)? {
                return Err(GraphError::CommitFailure {
                    message: format!("no primary key for new object {}", object.id),
                });
            }
            let op = WriteOp::Insert {
                entity: entity.clone(),
                id: object.id.clone(),
                values: values.clone(),
                generate_key: !key_known,
            };
            let results = tx.execute(&WriteBatch::single(op)).map_err(commit_failure)?;
            if !key_known {
                let generated = results
                    .into_iter()
                    .next()
                    .and_then(|r| r.generated_key)
                    .ok_or_else(|| GraphError::CommitFailure {
                        message: format!("storage generated no key for {}", object.id),
                    })?;
                values.extend(generated);
            }
            let permanent = resolver.object_id_from_row(&entity, &values)?;
            outcome.assigned.insert(object.id.clone(), permanent.clone());
            outcome.inserted.push((*handle, permanent, values));
        }

        for handle in &plan.updates {
            let object = self.graph.get(*handle)?;
            let mut values = Row::new();
            for name in self.pending_attributes(*handle)? {
                let column = resolver.attribute(&object.entity, &name)?.column.clone();
                values.insert(column, object.value(&name).cloned().unwrap_or(Value::Null));
            }
            for (rel, target) in self.pending_foreign_keys(*handle)? {
                write_foreign_key(&mut values, &rel, target.as_ref(), &outcome)?;
            }
            let (qualifier, check_row_count) = self.lock_qualifier(*handle)?;
            let op = WriteOp::Update {
                entity: object.entity.clone(),
                id: object.id.clone(),
                values: values.clone(),
                qualifier,
                check_row_count,
            };
            let results = tx.execute(&WriteBatch::single(op)).map_err(commit_failure)?;
            let affected = results.first().map_or(0, |r| r.affected);
            if check_row_count && affected == 0 {
                failures.push(self.lock_failure(*handle)?);
                continue;
            }
            outcome.updated.push((*handle, values));
        }

        let mut join_inserts = WriteBatch::new();
        let mut join_deletes = WriteBatch::new();
        for change in &plan.joins {
            let RelationshipKind::Flattened {
                join_table,
                source_joins,
                target_joins,
            } = &change.rel.kind
            else {
                continue;
            };
            let (Some(source), Some(target)) = (
                outcome.permanent(&change.source),
                outcome.permanent(&change.target),
            ) else {
                continue;
            };
            let mut values = Row::new();
            for join in source_joins {
                let value = source.key_value(&join.source_column).cloned().unwrap_or(Value::Null);
                values.insert(join.target_column.clone(), value);
            }
            for join in target_joins {
                let value = target.key_value(&join.target_column).cloned().unwrap_or(Value::Null);
                values.insert(join.source_column.clone(), value);
            }
            let table = join_table.clone();
            if change.insert {
                join_inserts.push(WriteOp::JoinInsert { table, values });
            } else {
                join_deletes.push(WriteOp::JoinDelete { table, values });
            }
        }
        for batch in [&join_inserts, &join_deletes] {
            if !batch.is_empty() {
                tx.execute(batch).map_err(commit_failure)?;
                outcome.join_rows += batch.len();
            }
        }

        for handle in &plan.deletes {
            let object = self.graph.get(*handle)?;
            let (qualifier, check_row_count) = self.lock_qualifier(*handle)?;
            let op = WriteOp::Delete {
                entity: object.entity.clone(),
                id: object.id.clone(),
                qualifier,
                check_row_count,
            };
            let results = tx.execute(&WriteBatch::single(op)).map_err(commit_failure)?;
            let affected = results.first().map_or(0, |r| r.affected);
            if check_row_count && affected == 0 {
                failures.push(self.lock_failure(*handle)?);
            }
        }

        if !failures.is_empty() {
            return Err(GraphError::OptimisticLockFailure { failures });
        }
        Ok(outcome)
    }

    /// Bring the session and the snapshot store in line with what storage
    /// now holds
    fn publish(
        &mut self,
        plan: CommitPlan,
        outcome: WriteOutcome,
        commit_id: CommitId,
    ) -> Result<CommitSummary> {
        for (handle, permanent, _) in &outcome.inserted {
            let current = self.graph.get(*handle)?.id.clone();
            if current != *permanent {
                self.graph.remap_identity(&current, permanent.clone())?;
            }
        }

        let mut committed: Vec<(ObjectHandle, ObjectId, Row)> = Vec::new();
        let mut changes = SnapshotChanges::default();
        for (handle, permanent, values) in &outcome.inserted {
            changes.updated.push(SnapshotUpdate {
                id: permanent.clone(),
                values: values.clone(),
                replaces_version: None,
            });
            committed.push((*handle, permanent.clone(), values.clone()));
        }
        for (handle, written) in &outcome.updated {
            let object = self.graph.get(*handle)?;
            let mut values = match self.store.get(&object.id) {
                Some(snapshot) => snapshot.values.clone(),
                None => object.current_row().clone(),
            };
            values.extend(written.clone());
            changes.updated.push(SnapshotUpdate {
                id: object.id.clone(),
                values: values.clone(),
                replaces_version: object.snapshot_version,
            });
            committed.push((*handle, object.id.clone(), values));
        }
        for handle in &plan.deletes {
            changes.deleted.push(self.graph.get(*handle)?.id.clone());
        }
        changes.indirectly_modified = plan
            .indirect
            .iter()
            .filter_map(|id| outcome.permanent(id))
            .collect();

        let installed = self.store.process_changes(Some(&self.id), changes);

        for (handle, id, values) in &committed {
            let snapshot = installed.get(id);
            let object = self.graph.get_mut(*handle)?;
            object.state = PersistenceState::Committed;
            object.baseline = snapshot.map_or_else(|| values.clone(), |s| s.values.clone());
            object.upstream = None;
            object.snapshot_version = snapshot.map(|s| s.version);
        }
        for handle in &plan.touched {
            self.graph.get_mut(*handle)?.state = PersistenceState::Committed;
        }
        for handle in &plan.deletes {
            self.graph.unregister(*handle)?;
        }
        self.tracker.clear_all();

        let hook = &self.runtime.hook;
        for handle in committed.iter().map(|(h, _, _)| h).chain(&plan.touched) {
            let object = self.graph.get(*handle)?;
            if let Err(message) = hook.validate(&ObjectView::new(object), ValidationPhase::PostCommit)
            {
                warn!(
                    component = module_path!(),
                    session_id = %self.id,
                    object_id = %object.id,
                    reason = %message,
                    "post-commit validation failed"
                );
            }
        }

        Ok(CommitSummary {
            commit_id,
            inserted: outcome.inserted.len(),
            updated: outcome.updated.len(),
            deleted: plan.deletes.len(),
            join_rows: outcome.join_rows,
            phantom: false,
        })
    }
}
