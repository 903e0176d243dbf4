use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{ObjectId, Row, Value};

/// Lifecycle state of a domain object within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    Transient,
    New,
    Committed,
    Modified,
    Hollow,
    Deleted,
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceState::Transient => "TRANSIENT",
            PersistenceState::New => "NEW",
            PersistenceState::Committed => "COMMITTED",
            PersistenceState::Modified => "MODIFIED",
            PersistenceState::Hollow => "HOLLOW",
            PersistenceState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Value of one relationship on one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArcValue {
    /// Not fetched yet; resolving reads the foreign key or queries storage
    Fault,
    ToOne(Option<ObjectId>),
    ToMany(Vec<ObjectId>),
}

impl ArcValue {
    pub fn is_fault(&self) -> bool {
        matches!(self, ArcValue::Fault)
    }

    /// Whether the resolved arc points at `id`
    pub fn contains(&self, id: &ObjectId) -> bool {
        match self {
            ArcValue::Fault => false,
            ArcValue::ToOne(target) => target.as_ref() == Some(id),
            ArcValue::ToMany(targets) => targets.contains(id),
        }
    }

    /// Resolved targets; empty for a fault
    pub fn targets(&self) -> Vec<ObjectId> {
        match self {
            ArcValue::Fault => Vec::new(),
            ArcValue::ToOne(target) => target.iter().cloned().collect(),
            ArcValue::ToMany(targets) => targets.clone(),
        }
    }
}

/// Live in-memory representative of one identity, owned by an identity map
#[derive(Debug, Clone)]
pub struct DomainObject {
    pub(crate) id: ObjectId,
    /// Concrete entity; may be a subentity of the identity's tag
    pub(crate) entity: String,
    pub(crate) state: PersistenceState,
    /// Attribute name to current value
    pub(crate) values: IndexMap<String, Value>,
    pub(crate) arcs: IndexMap<String, ArcValue>,
    /// Row as of the last synchronisation with storage; the lock baseline
    pub(crate) baseline: Row,
    /// Upstream row merged under pending edits; unset once synchronised
    pub(crate) upstream: Option<Row>,
    pub(crate) snapshot_version: Option<u64>,
    /// Permanent identity requested at creation, bound on insert
    pub(crate) preassigned: Option<ObjectId>,
}

impl DomainObject {
    pub(crate) fn new(id: ObjectId, entity: impl Into<String>, state: PersistenceState) -> Self {
        Self {
            id,
            entity: entity.into(),
            state,
            values: IndexMap::new(),
            arcs: IndexMap::new(),
            baseline: Row::new(),
            upstream: None,
            snapshot_version: None,
            preassigned: None,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn arc(&self, relationship: &str) -> Option<&ArcValue> {
        self.arcs.get(relationship)
    }

    pub fn baseline(&self) -> &Row {
        &self.baseline
    }

    /// Latest row known from storage; foreign keys of untouched to-one
    /// relationships resolve from it
    pub fn current_row(&self) -> &Row {
        self.upstream.as_ref().unwrap_or(&self.baseline)
    }

    pub fn snapshot_version(&self) -> Option<u64> {
        self.snapshot_version
    }

    /// Rewrite references to `old` in every resolved arc
    pub(crate) fn replace_references(&mut self, old: &ObjectId, new: &ObjectId) {
        for arc in self.arcs.values_mut() {
            match arc {
                ArcValue::ToOne(Some(target)) if *target == *old => *target = new.clone(),
                ArcValue::ToMany(targets) => {
                    for target in targets.iter_mut().filter(|t| **t == *old) {
                        *target = new.clone();
                    }
                }
                _ => {}
            }
        }
    }

    /// Drop references to `id` from every resolved arc
    pub(crate) fn remove_references(&mut self, id: &ObjectId) {
        for arc in self.arcs.values_mut() {
            match arc {
                ArcValue::ToOne(target) if target.as_ref() == Some(id) => *target = None,
                ArcValue::ToMany(targets) => targets.retain(|t| t != id),
                _ => {}
            }
        }
    }
}

/// Read-only view handed to validation hooks and delegates
#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    object: &'a DomainObject,
}

impl<'a> ObjectView<'a> {
    pub fn new(object: &'a DomainObject) -> Self {
        Self { object }
    }

    pub fn id(&self) -> &'a ObjectId {
        &self.object.id
    }

    pub fn entity(&self) -> &'a str {
        &self.object.entity
    }

    pub fn state(&self) -> PersistenceState {
        self.object.state
    }

    pub fn value(&self, attribute: &str) -> Option<&'a Value> {
        self.object.values.get(attribute)
    }

    pub fn values(&self) -> &'a IndexMap<String, Value> {
        &self.object.values
    }

    pub fn arc(&self, relationship: &str) -> Option<&'a ArcValue> {
        self.object.arcs.get(relationship)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Painting", "PAINTING_ID", Value::Int(n))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PersistenceState::Hollow.to_string(), "HOLLOW");
        assert_eq!(PersistenceState::Modified.to_string(), "MODIFIED");
    }

    #[test]
    fn test_replace_and_remove_references() {
        let mut obj = DomainObject::new(id(0), "Artist", PersistenceState::Committed);
        obj.arcs
            .insert("paintingArray".into(), ArcValue::ToMany(vec![id(1), id(2)]));
        obj.arcs.insert("favorite".into(), ArcValue::ToOne(Some(id(1))));

        obj.replace_references(&id(1), &id(9));
        assert!(obj.arc("paintingArray").unwrap().contains(&id(9)));
        assert_eq!(obj.arc("favorite"), Some(&ArcValue::ToOne(Some(id(9)))));

        obj.remove_references(&id(9));
        assert_eq!(obj.arc("paintingArray"), Some(&ArcValue::ToMany(vec![id(2)])));
        assert_eq!(obj.arc("favorite"), Some(&ArcValue::ToOne(None)));
    }
}
