//! Diff log entries and per-object compaction.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{ObjectId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArcChangeKind {
    /// To-one assignment
    Set,
    /// To-many insertion
    Add,
    /// To-many removal
    Remove,
}

/// One atomic mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiffOp {
    Created,
    Deleted,
    Attribute {
        name: String,
        old: Value,
        new: Value,
    },
    Arc {
        relationship: String,
        /// Set: new target or `None`; Add/Remove: the member
        target: Option<ObjectId>,
        /// Set only: target before the assignment
        previous: Option<ObjectId>,
        kind: ArcChangeKind,
    },
}

impl DiffOp {
    /// An attribute write of the value it already had
    pub fn is_phantom(&self) -> bool {
        matches!(self, DiffOp::Attribute { old, new, .. } if old == new)
    }

    pub fn is_arc(&self) -> bool {
        matches!(self, DiffOp::Arc { .. })
    }

    pub fn relationship(&self) -> Option<&str> {
        match self {
            DiffOp::Arc { relationship, .. } => Some(relationship),
            _ => None,
        }
    }
}

/// Timestamped, sequenced mutation of one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Session-wide recording order
    pub seq: u64,
    pub id: ObjectId,
    pub op: DiffOp,
    pub recorded_at: DateTime<Utc>,
}

/// Accumulated log of one identity since the last synchronisation point
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDiff {
    id: ObjectId,
    entries: Vec<DiffEntry>,
    force_validation: bool,
}

impl ObjectDiff {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            entries: Vec::new(),
            force_validation: false,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, entry: DiffEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn set_force_validation(&mut self) {
        self.force_validation = true;
    }

    pub fn force_validation(&self) -> bool {
        self.force_validation
    }

    pub(crate) fn remap(&mut self, old: &ObjectId, new: &ObjectId) {
        if &self.id == old {
            self.id = new.clone();
        }
        for entry in &mut self.entries {
            if &entry.id == old {
                entry.id = new.clone();
            }
            if let DiffOp::Arc {
                target, previous, ..
            } = &mut entry.op
            {
                for slot in [target, previous] {
                    if slot.as_ref() == Some(old) {
                        *slot = Some(new.clone());
                    }
                }
            }
        }
    }

    /// All net changes are attribute writes of unchanged values
    ///
    /// Lifecycle and relationship entries are never phantom.
    pub fn is_phantom(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self
            .entries
            .iter()
            .any(|e| matches!(e.op, DiffOp::Created | DiffOp::Deleted | DiffOp::Arc { .. }))
        {
            return false;
        }
        self.net_attribute_changes()
            .values()
            .all(|(old, new)| old == new)
    }

    pub fn has_arc_changes(&self) -> bool {
        self.entries.iter().any(|e| e.op.is_arc())
    }

    /// Validation hooks run unless the diff is phantom and not forced
    pub fn needs_validation(&self) -> bool {
        self.force_validation || !self.is_phantom()
    }

    /// Attribute name to (value before the first write, value after the last)
    pub fn net_attribute_changes(&self) -> IndexMap<String, (Value, Value)> {
        let mut net: IndexMap<String, (Value, Value)> = IndexMap::new();
        for entry in &self.entries {
            if let DiffOp::Attribute { name, old, new } = &entry.op {
                net.entry(name.clone())
                    .and_modify(|(_, last)| *last = new.clone())
                    .or_insert_with(|| (old.clone(), new.clone()));
            }
        }
        net
    }

    /// Value an attribute had before this unit of work touched it
    pub fn original_value(&self, attribute: &str) -> Option<&Value> {
        self.entries.iter().find_map(|e| match &e.op {
            DiffOp::Attribute { name, old, .. } if name == attribute => Some(old),
            _ => None,
        })
    }

    /// Arc operations on one relationship, in recording order
    pub fn arc_ops<'a>(
        &'a self,
        relationship: &'a str,
    ) -> impl Iterator<Item = &'a DiffOp> + 'a {
        self.entries
            .iter()
            .map(|e| &e.op)
            .filter(move |op| op.relationship() == Some(relationship))
    }

    pub fn compacted(&self) -> Vec<DiffEntry> {
        compact_entries(&self.entries)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Membership {
    Added,
    Removed,
}

/// Collapse a log into its net effect, per identity
///
/// - attribute writes keep the first old and the last new value
/// - repeated to-one sets keep the original previous and the final target
/// - a to-many add and remove of the same member cancel out
/// - an identity created and deleted within the log disappears entirely
/// - a deleted identity keeps its relationship changes but no attribute writes
///
/// Output is ordered by the sequence number of each surviving entry.
pub fn compact_entries(entries: &[DiffEntry]) -> Vec<DiffEntry> {
    let mut by_id: IndexMap<&ObjectId, Vec<&DiffEntry>> = IndexMap::new();
    for entry in entries {
        by_id.entry(&entry.id).or_default().push(entry);
    }

    let mut out: Vec<DiffEntry> = Vec::new();
    for (_, group) in by_id {
        out.extend(compact_object(&group));
    }
    out.sort_by_key(|e| e.seq);
    out
}

fn compact_object(entries: &[&DiffEntry]) -> Vec<DiffEntry> {
    let created = entries.iter().find(|e| e.op == DiffOp::Created);
    let deleted = entries.iter().find(|e| e.op == DiffOp::Deleted);
    if created.is_some() && deleted.is_some() {
        return Vec::new();
    }

    let mut out: Vec<DiffEntry> = Vec::new();
    if let Some(entry) = created {
        out.push((*entry).clone());
    }

    let mut attributes: IndexMap<&str, DiffEntry> = IndexMap::new();
    let mut sets: IndexMap<&str, DiffEntry> = IndexMap::new();
    let mut members: IndexMap<(&str, &ObjectId), (Membership, DiffEntry)> = IndexMap::new();

    for entry in entries {
        match &entry.op {
            DiffOp::Created | DiffOp::Deleted => {}
            DiffOp::Attribute { name, new, .. } => {
                attributes
                    .entry(name.as_str())
                    .and_modify(|kept| {
                        if let DiffOp::Attribute { new: last, .. } = &mut kept.op {
                            *last = new.clone();
                        }
                        kept.recorded_at = entry.recorded_at;
                    })
                    .or_insert_with(|| (*entry).clone());
            }
            DiffOp::Arc {
                relationship,
                target,
                kind: ArcChangeKind::Set,
                ..
            } => {
                sets.entry(relationship.as_str())
                    .and_modify(|kept| {
                        if let DiffOp::Arc { target: last, .. } = &mut kept.op {
                            *last = target.clone();
                        }
                        kept.recorded_at = entry.recorded_at;
                    })
                    .or_insert_with(|| (*entry).clone());
            }
            DiffOp::Arc {
                relationship,
                target: Some(member),
                kind,
                ..
            } => {
                let change = if *kind == ArcChangeKind::Add {
                    Membership::Added
                } else {
                    Membership::Removed
                };
                let key = (relationship.as_str(), member);
                match members.get(&key).map(|(m, _)| *m) {
                    Some(existing) if existing != change => {
                        members.shift_remove(&key);
                    }
                    Some(_) => {}
                    None => {
                        members.insert(key, (change, (*entry).clone()));
                    }
                }
            }
            DiffOp::Arc { target: None, .. } => {}
        }
    }

    if let Some(entry) = deleted {
        out.push((*entry).clone());
    } else {
        out.extend(attributes.into_values());
    }
    out.extend(sets.into_values());
    out.extend(members.into_values().map(|(_, entry)| entry));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", Value::Int(1))
    }

    fn painting(n: i64) -> ObjectId {
        ObjectId::single("Painting", "PAINTING_ID", Value::Int(n))
    }

    fn entry(seq: u64, id: ObjectId, op: DiffOp) -> DiffEntry {
        DiffEntry {
            seq,
            id,
            op,
            recorded_at: Utc::now(),
        }
    }

    fn attr(name: &str, old: &str, new: &str) -> DiffOp {
        DiffOp::Attribute {
            name: name.to_string(),
            old: old.into(),
            new: new.into(),
        }
    }

    fn member(kind: ArcChangeKind, n: i64) -> DiffOp {
        DiffOp::Arc {
            relationship: "paintingArray".to_string(),
            target: Some(painting(n)),
            previous: None,
            kind,
        }
    }

    #[test]
    fn test_attribute_writes_collapse() {
        let entries = vec![
            entry(1, artist(), attr("artistName", "a", "b")),
            entry(2, artist(), attr("artistName", "b", "c")),
        ];
        let compacted = compact_entries(&entries);
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].op, attr("artistName", "a", "c"));
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let entries = vec![
            entry(1, artist(), member(ArcChangeKind::Add, 1)),
            entry(2, artist(), member(ArcChangeKind::Add, 2)),
            entry(3, artist(), member(ArcChangeKind::Remove, 1)),
        ];
        let compacted = compact_entries(&entries);
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].op, member(ArcChangeKind::Add, 2));
    }

    #[test]
    fn test_repeated_set_keeps_original_previous() {
        let set = |previous: Option<i64>, target: Option<i64>| DiffOp::Arc {
            relationship: "toArtist".to_string(),
            target: target.map(painting),
            previous: previous.map(painting),
            kind: ArcChangeKind::Set,
        };
        let entries = vec![
            entry(1, painting(9), set(Some(1), Some(2))),
            entry(2, painting(9), set(Some(2), Some(3))),
        ];
        let compacted = compact_entries(&entries);
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].op, set(Some(1), Some(3)));
    }

    #[test]
    fn test_created_then_deleted_vanishes() {
        let entries = vec![
            entry(1, artist(), DiffOp::Created),
            entry(2, artist(), attr("artistName", "", "x")),
            entry(3, artist(), DiffOp::Deleted),
        ];
        assert!(compact_entries(&entries).is_empty());
    }

    #[test]
    fn test_phantom_detection_uses_net_values() {
        let mut diff = ObjectDiff::new(artist());
        diff.push(entry(1, artist(), attr("artistName", "a", "b")));
        assert!(!diff.is_phantom());
        diff.push(entry(2, artist(), attr("artistName", "b", "a")));
        assert!(diff.is_phantom());
        assert!(!diff.needs_validation());

        diff.set_force_validation();
        assert!(diff.needs_validation());
    }

    #[test]
    fn test_arc_change_is_never_phantom() {
        let mut diff = ObjectDiff::new(artist());
        diff.push(entry(1, artist(), attr("artistName", "a", "a")));
        diff.push(entry(2, artist(), member(ArcChangeKind::Add, 1)));
        assert!(!diff.is_phantom());
        assert!(diff.needs_validation());
    }

    #[test]
    fn test_arc_ops_filter_by_relationship_name() {
        let mut diff = ObjectDiff::new(artist());
        diff.push(entry(1, artist(), attr("artistName", "a", "b")));
        diff.push(entry(2, artist(), member(ArcChangeKind::Add, 1)));
        diff.push(entry(3, artist(), member(ArcChangeKind::Remove, 2)));

        let name = ["painting", "Array"].concat();
        let ops: Vec<&DiffOp> = diff.arc_ops(&name).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1], &member(ArcChangeKind::Remove, 2));
        assert_eq!(diff.arc_ops("toGallery").count(), 0);
    }
}
