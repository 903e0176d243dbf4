//! Persistent identity of one row
//!
//! An identity is an entity tag plus either the ordered primary key map
//! (permanent) or a process-unique surrogate (temporary). Entities of one
//! inheritance hierarchy share the tag of the hierarchy root, so a row has
//! exactly one identity no matter which entity it was fetched through.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Value;

/// Key part of an [`ObjectId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdKey {
    /// Primary key column to value
    Permanent(BTreeMap<String, Value>),
    /// Surrogate assigned before the row exists in storage
    Temporary(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

impl ObjectId {
    pub fn permanent(entity: impl Into<String>, key: BTreeMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(key),
        }
    }

    /// Permanent identity with a single key column
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: Value) -> Self {
        let mut key = BTreeMap::new();
        key.insert(column.into(), value);
        Self::permanent(entity, key)
    }

    /// Fresh temporary identity; never equal to any other identity
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(Uuid::now_v7()),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn key(&self) -> &IdKey {
        &self.key
    }

    /// Primary key values, `None` for temporary identities
    pub fn key_values(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.key {
            IdKey::Permanent(values) => Some(values),
            IdKey::Temporary(_) => None,
        }
    }

    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key_values().and_then(|k| k.get(column))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Permanent(values) => {
                write!(f, "{}{{", self.entity)?;
                for (i, (column, value)) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", column, value)?;
                }
                write!(f, "}}")
            }
            IdKey::Temporary(uuid) => write!(f, "{}<temp:{}>", self.entity, uuid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_ids_compare_by_entity_and_key() {
        let a = ObjectId::single("Artist", "ARTIST_ID", Value::Int(1));
        let b = ObjectId::single("Artist", "ARTIST_ID", Value::Int(1));
        let c = ObjectId::single("Painting", "ARTIST_ID", Value::Int(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_temporary_ids_are_unique() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert!(a.key_values().is_none());
    }

    #[test]
    fn test_compound_key_display() {
        let mut key = BTreeMap::new();
        key.insert("EXHIBIT_ID".to_string(), Value::Int(2));
        key.insert("ARTIST_ID".to_string(), Value::Int(1));
        let id = ObjectId::permanent("ArtistExhibit", key);
        assert_eq!(id.to_string(), "ArtistExhibit{ARTIST_ID=1, EXHIBIT_ID=2}");
    }
}
