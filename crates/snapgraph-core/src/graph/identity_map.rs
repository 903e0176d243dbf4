//! Per-session identity map
//!
//! Objects live in an arena addressed by [`ObjectHandle`]; relationships
//! between them are identity-keyed arcs, never owning pointers. The index
//! from identity to handle is the single source of uniqueness: one live
//! object per identity per session.

use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;

use super::{DomainObject, PersistenceState};
use crate::errors::{GraphError, Result};
use crate::model::ObjectId;

/// Stable session-local reference to a registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct IdentityMap {
    objects: IndexMap<ObjectHandle, DomainObject>,
    index: HashMap<ObjectId, ObjectHandle>,
    /// Permanent identities promised to NEW objects that still hold a
    /// temporary one
    pending_keys: HashMap<ObjectId, ObjectHandle>,
    retired: HashSet<ObjectHandle>,
    next_handle: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn allocate(&mut self) -> ObjectHandle {
        self.next_handle += 1;
        ObjectHandle(self.next_handle)
    }

    /// Return the object registered for `id`, or register a new one in
    /// `initial_state` (ignored for existing objects)
    ///
    /// The boolean is `true` when the object was created.
    ///
    /// # Errors
    ///
    /// Returns `IdentityConflict` if `id` is promised to a NEW object that
    /// still carries its temporary identity.
    pub fn get_or_create(
        &mut self,
        id: ObjectId,
        entity: &str,
        initial_state: PersistenceState,
    ) -> Result<(ObjectHandle, bool)> {
        if let Some(handle) = self.index.get(&id) {
            return Ok((*handle, false));
        }
        if let Some(handle) = self.pending_keys.get(&id) {
            let old_id = self
                .objects
                .get(handle)
                .map(|o| o.id.to_string())
                .unwrap_or_default();
            return Err(GraphError::IdentityConflict {
                old_id,
                new_id: id.to_string(),
            });
        }
        let handle = self.allocate();
        self.index.insert(id.clone(), handle);
        self.objects
            .insert(handle, DomainObject::new(id, entity, initial_state));
        Ok((handle, true))
    }

    /// Register a NEW object under a temporary identity, optionally promising
    /// it a permanent one
    ///
    /// # Errors
    ///
    /// Returns `IdentityConflict` if the temporary identity is taken or the
    /// promised identity is already registered or promised.
    pub fn register_new(
        &mut self,
        id: ObjectId,
        entity: &str,
        preassigned: Option<ObjectId>,
    ) -> Result<ObjectHandle> {
        if self.index.contains_key(&id) {
            return Err(GraphError::IdentityConflict {
                old_id: id.to_string(),
                new_id: id.to_string(),
            });
        }
        if let Some(permanent) = &preassigned {
            if self.index.contains_key(permanent) || self.pending_keys.contains_key(permanent) {
                return Err(GraphError::IdentityConflict {
                    old_id: id.to_string(),
                    new_id: permanent.to_string(),
                });
            }
        }
        let handle = self.allocate();
        let mut object = DomainObject::new(id.clone(), entity, PersistenceState::New);
        if let Some(permanent) = preassigned {
            self.pending_keys.insert(permanent.clone(), handle);
            object.preassigned = Some(permanent);
        }
        self.index.insert(id, handle);
        self.objects.insert(handle, object);
        Ok(handle)
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<ObjectHandle> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Whether the handle belonged to an object that has since been removed
    pub fn is_retired(&self, handle: ObjectHandle) -> bool {
        self.retired.contains(&handle)
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&DomainObject> {
        self.objects
            .get(&handle)
            .ok_or(GraphError::ObjectNotRegistered { handle: handle.0 })
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut DomainObject> {
        self.objects
            .get_mut(&handle)
            .ok_or(GraphError::ObjectNotRegistered { handle: handle.0 })
    }

    /// Change a registered object's identity, re-indexing it and rewriting
    /// every arc that referenced the old identity
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `old` is not registered and
    /// `IdentityConflict` if `new` is bound to a different object.
    pub fn remap_identity(&mut self, old: &ObjectId, new: ObjectId) -> Result<ObjectHandle> {
        let handle = self
            .index
            .get(old)
            .copied()
            .ok_or_else(|| GraphError::Internal {
                message: format!("cannot remap unregistered identity {}", old),
            })?;
        if let Some(other) = self.index.get(&new) {
            if *other != handle {
                return Err(GraphError::IdentityConflict {
                    old_id: old.to_string(),
                    new_id: new.to_string(),
                });
            }
            return Ok(handle);
        }
        if let Some(other) = self.pending_keys.get(&new) {
            if *other != handle {
                return Err(GraphError::IdentityConflict {
                    old_id: old.to_string(),
                    new_id: new.to_string(),
                });
            }
        }

        self.index.remove(old);
        self.pending_keys.retain(|_, h| *h != handle);
        self.index.insert(new.clone(), handle);
        for object in self.objects.values_mut() {
            object.replace_references(old, &new);
        }
        let object = self.get_mut(handle)?;
        object.id = new;
        object.preassigned = None;
        Ok(handle)
    }

    /// Remove an object; it becomes TRANSIENT and resolved arcs of other
    /// objects stop referencing it
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotRegistered` for unknown handles.
    pub fn unregister(&mut self, handle: ObjectHandle) -> Result<DomainObject> {
        let mut object = self
            .objects
            .shift_remove(&handle)
            .ok_or(GraphError::ObjectNotRegistered { handle: handle.0 })?;
        self.index.remove(&object.id);
        self.pending_keys.retain(|_, h| *h != handle);
        self.retired.insert(handle);
        for other in self.objects.values_mut() {
            other.remove_references(&object.id);
        }
        object.state = PersistenceState::Transient;
        Ok(object)
    }

    pub fn for_each_registered<F>(&self, mut f: F)
    where
        F: FnMut(ObjectHandle, &DomainObject),
    {
        for (handle, object) in &self.objects {
            f(*handle, object);
        }
    }

    /// Handles in registration order
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.objects.keys().copied().collect()
    }

    pub fn handles_in_state(&self, state: PersistenceState) -> Vec<ObjectHandle> {
        self.objects
            .iter()
            .filter(|(_, o)| o.state == state)
            .map(|(h, _)| *h)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ArcValue;
    use crate::model::Value;

    fn artist(n: i64) -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", Value::Int(n))
    }

    #[test]
    fn test_get_or_create_returns_same_handle() {
        let mut map = IdentityMap::new();
        let (a, created_a) = map
            .get_or_create(artist(1), "Artist", PersistenceState::Hollow)
            .unwrap();
        let (b, created_b) = map
            .get_or_create(artist(1), "Artist", PersistenceState::Committed)
            .unwrap();

        assert_eq!(a, b);
        assert!(created_a);
        assert!(!created_b);
        // initial state of the second call is ignored
        assert_eq!(map.get(a).unwrap().state(), PersistenceState::Hollow);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remap_rewrites_index_and_arcs() {
        let mut map = IdentityMap::new();
        let temp = ObjectId::temporary("Artist");
        let new = map.register_new(temp.clone(), "Artist", None).unwrap();
        let (painting, _) = map
            .get_or_create(
                ObjectId::single("Painting", "PAINTING_ID", Value::Int(5)),
                "Painting",
                PersistenceState::Committed,
            )
            .unwrap();
        map.get_mut(painting)
            .unwrap()
            .arcs
            .insert("toArtist".into(), ArcValue::ToOne(Some(temp.clone())));

        let remapped = map.remap_identity(&temp, artist(7)).unwrap();

        assert_eq!(remapped, new);
        assert_eq!(map.lookup(&artist(7)), Some(new));
        assert_eq!(map.lookup(&temp), None);
        assert_eq!(map.get(new).unwrap().id(), &artist(7));
        assert!(map
            .get(painting)
            .unwrap()
            .arc("toArtist")
            .unwrap()
            .contains(&artist(7)));
    }

    #[test]
    fn test_remap_onto_taken_identity_conflicts() {
        let mut map = IdentityMap::new();
        map.get_or_create(artist(1), "Artist", PersistenceState::Committed)
            .unwrap();
        let temp = ObjectId::temporary("Artist");
        map.register_new(temp.clone(), "Artist", None).unwrap();

        let result = map.remap_identity(&temp, artist(1));
        assert!(matches!(result, Err(GraphError::IdentityConflict { .. })));
        // nothing was re-indexed
        assert!(map.lookup(&temp).is_some());
    }

    #[test]
    fn test_promised_identity_cannot_be_registered_twice() {
        let mut map = IdentityMap::new();
        map.register_new(ObjectId::temporary("Artist"), "Artist", Some(artist(3)))
            .unwrap();

        let result = map.get_or_create(artist(3), "Artist", PersistenceState::Hollow);
        assert!(matches!(result, Err(GraphError::IdentityConflict { .. })));
    }

    #[test]
    fn test_unregister_marks_transient_and_retires_handle() {
        let mut map = IdentityMap::new();
        let (h, _) = map
            .get_or_create(artist(1), "Artist", PersistenceState::Committed)
            .unwrap();
        let removed = map.unregister(h).unwrap();

        assert_eq!(removed.state(), PersistenceState::Transient);
        assert!(map.is_retired(h));
        assert!(map.get(h).is_err());
        assert!(map.lookup(&artist(1)).is_none());
    }
}
