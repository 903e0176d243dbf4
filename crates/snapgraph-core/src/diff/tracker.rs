//! Per-session change tracker
//!
//! Records every mutation made through a session, grouped by identity, in
//! a single session-wide sequence. Checkpoints are sequence numbers, so
//! "changes since a checkpoint" is a filter rather than a copy.

use chrono::Utc;
use indexmap::IndexMap;

use super::model::{ArcChangeKind, DiffEntry, DiffOp, ObjectDiff};
use crate::model::{ObjectId, Value};

/// Position in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(u64);

#[derive(Debug, Default)]
pub struct ChangeTracker {
    diffs: IndexMap<ObjectId, ObjectDiff>,
    next_seq: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, id: &ObjectId, op: DiffOp) {
        self.next_seq += 1;
        let entry = DiffEntry {
            seq: self.next_seq,
            id: id.clone(),
            op,
            recorded_at: Utc::now(),
        };
        self.diffs
            .entry(id.clone())
            .or_insert_with(|| ObjectDiff::new(id.clone()))
            .push(entry);
    }

    pub fn record_created(&mut self, id: &ObjectId) {
        self.record(id, DiffOp::Created);
    }

    pub fn record_deleted(&mut self, id: &ObjectId) {
        self.record(id, DiffOp::Deleted);
    }

    pub fn record_attribute_change(&mut self, id: &ObjectId, name: &str, old: Value, new: Value) {
        self.record(
            id,
            DiffOp::Attribute {
                name: name.to_string(),
                old,
                new,
            },
        );
    }

    pub fn record_arc_change(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
        previous: Option<ObjectId>,
        kind: ArcChangeKind,
    ) {
        self.record(
            id,
            DiffOp::Arc {
                relationship: relationship.to_string(),
                target,
                previous,
                kind,
            },
        );
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.next_seq)
    }

    /// Entries recorded after `checkpoint`, in recording order
    pub fn diffs_since(&self, checkpoint: Checkpoint) -> Vec<DiffEntry> {
        let mut entries: Vec<DiffEntry> = self
            .diffs
            .values()
            .flat_map(|d| d.entries().iter())
            .filter(|e| e.seq > checkpoint.0)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Every entry, in recording order
    pub fn all_entries(&self) -> Vec<DiffEntry> {
        self.diffs_since(Checkpoint(0))
    }

    pub fn diff(&self, id: &ObjectId) -> Option<&ObjectDiff> {
        self.diffs.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.diffs.keys()
    }

    pub fn has_changes(&self) -> bool {
        self.diffs.values().any(|d| !d.is_empty())
    }

    /// Drop the log of one identity
    pub fn clear(&mut self, id: &ObjectId) -> Option<ObjectDiff> {
        self.diffs.shift_remove(id)
    }

    pub fn clear_all(&mut self) {
        self.diffs.clear();
    }

    /// Re-key the log after an identity change and rewrite references to it
    pub fn remap(&mut self, old: &ObjectId, new: &ObjectId) {
        if let Some(mut diff) = self.diffs.shift_remove(old) {
            diff.remap(old, new);
            self.diffs.insert(new.clone(), diff);
        }
        for diff in self.diffs.values_mut() {
            diff.remap(old, new);
        }
    }

    /// Force validation hooks to run for `id` even when its diff is phantom
    pub fn mark_force_validation(&mut self, id: &ObjectId) {
        self.diffs
            .entry(id.clone())
            .or_insert_with(|| ObjectDiff::new(id.clone()))
            .set_force_validation();
    }

    /// Remove arc entries for one relationship of one identity
    pub(crate) fn drop_arc_entries(&mut self, id: &ObjectId, relationship: &str) {
        if let Some(diff) = self.diffs.get(id) {
            let kept: Vec<DiffEntry> = diff
                .entries()
                .iter()
                .filter(|e| e.op.relationship() != Some(relationship))
                .cloned()
                .collect();
            let force = diff.force_validation();
            let mut replaced = ObjectDiff::new(id.clone());
            for entry in kept {
                replaced.push(entry);
            }
            if force {
                replaced.set_force_validation();
            }
            self.diffs.insert(id.clone(), replaced);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist(n: i64) -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", Value::Int(n))
    }

    #[test]
    fn test_diffs_since_checkpoint() {
        let mut tracker = ChangeTracker::new();
        tracker.record_attribute_change(&artist(1), "artistName", "a".into(), "b".into());
        let cp = tracker.checkpoint();
        tracker.record_attribute_change(&artist(2), "artistName", "x".into(), "y".into());
        tracker.record_deleted(&artist(1));

        let since = tracker.diffs_since(cp);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].id, artist(2));
        assert_eq!(since[1].op, DiffOp::Deleted);
        assert_eq!(tracker.all_entries().len(), 3);
    }

    #[test]
    fn test_remap_rewrites_keys_and_targets() {
        let mut tracker = ChangeTracker::new();
        let temp = ObjectId::temporary("Artist");
        tracker.record_created(&temp);
        let painting = ObjectId::single("Painting", "PAINTING_ID", Value::Int(4));
        tracker.record_arc_change(
            &painting,
            "toArtist",
            Some(temp.clone()),
            None,
            ArcChangeKind::Set,
        );

        tracker.remap(&temp, &artist(9));

        assert!(tracker.diff(&temp).is_none());
        assert!(tracker.diff(&artist(9)).is_some());
        let ops: Vec<_> = tracker
            .diff(&painting)
            .unwrap()
            .arc_ops("toArtist")
            .cloned()
            .collect();
        assert!(matches!(
            &ops[0],
            DiffOp::Arc { target: Some(t), .. } if *t == artist(9)
        ));
    }

    #[test]
    fn test_force_validation_without_entries() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_force_validation(&artist(1));
        let diff = tracker.diff(&artist(1)).unwrap();
        assert!(diff.is_empty());
        assert!(diff.needs_validation());
        assert!(!tracker.has_changes());
    }
}
