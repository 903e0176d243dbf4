//! Entity resolver
//!
//! Validated lookup over all entity descriptors of one mapping. The session,
//! the fault resolver and the commit coordinator go through it for every
//! mapping question, keyed by entity name rather than by any runtime type.

use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;

use super::{Attribute, EntityDescriptor, LockType, ObjectId, Relationship, RelationshipKind, Row, Value};
use crate::collab::Qualifier;
use crate::errors::{GraphError, Result};

#[derive(Debug, Clone)]
pub struct EntityResolver {
    entities: IndexMap<String, EntityDescriptor>,
}

fn invalid(reason: impl Into<String>) -> GraphError {
    GraphError::InvalidMapping {
        reason: reason.into(),
    }
}

impl EntityResolver {
    /// Build a resolver, validating the mapping as a whole
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` for duplicate entities, unknown super
    /// entities or relationship targets, inheritance cycles, missing keys,
    /// empty joins, to-one joins that do not end on the target key, and
    /// to-many relationships without a to-one reverse.
    pub fn new(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Result<Self> {
        let mut entities = IndexMap::new();
        for descriptor in descriptors {
            if entities.contains_key(&descriptor.name) {
                return Err(invalid(format!("duplicate entity {}", descriptor.name)));
            }
            entities.insert(descriptor.name.clone(), descriptor);
        }
        let resolver = Self { entities };
        resolver.validate()?;
        Ok(resolver)
    }

    /// Build a resolver from a JSON array of entity descriptors
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` when the document does not parse or the
    /// mapping it describes is invalid.
    pub fn from_json(text: &str) -> Result<Self> {
        let descriptors: Vec<EntityDescriptor> = serde_json::from_str(text)
            .map_err(|e| invalid(format!("unreadable mapping document: {}", e)))?;
        Self::new(descriptors)
    }

    /// The mapping as a JSON document accepted by [`EntityResolver::from_json`]
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a descriptor cannot be serialized.
    pub fn to_json(&self) -> Result<String> {
        let descriptors: Vec<&EntityDescriptor> = self.entities.values().collect();
        serde_json::to_string_pretty(&descriptors).map_err(|e| GraphError::Internal {
            message: format!("mapping serialization failed: {}", e),
        })
    }

    fn validate(&self) -> Result<()> {
        for descriptor in self.entities.values() {
            // ancestry() detects unknown supers and cycles
            let chain = self.ancestry(&descriptor.name)?;
            let root = chain[0];
            if root.table.is_empty() {
                return Err(invalid(format!("entity {} has no table", root.name)));
            }
            if root.pk_columns.is_empty() {
                return Err(invalid(format!("entity {} has no primary key", root.name)));
            }
            for rel in &descriptor.relationships {
                self.validate_relationship(descriptor, rel)?;
            }
        }
        Ok(())
    }

    fn validate_relationship(&self, source: &EntityDescriptor, rel: &Relationship) -> Result<()> {
        let target = self.entities.get(&rel.target).ok_or_else(|| {
            invalid(format!(
                "relationship {}.{} targets unknown entity {}",
                source.name, rel.name, rel.target
            ))
        })?;
        let empty = match &rel.kind {
            RelationshipKind::ToOne { joins } | RelationshipKind::ToMany { joins } => joins.is_empty(),
            RelationshipKind::Flattened {
                source_joins,
                target_joins,
                ..
            } => source_joins.is_empty() || target_joins.is_empty(),
        };
        if empty {
            return Err(invalid(format!("relationship {}.{} has no joins", source.name, rel.name)));
        }

        if let RelationshipKind::ToOne { joins } = &rel.kind {
            let target_pk: HashSet<&str> = self
                .pk_columns(&target.name)?
                .iter()
                .map(String::as_str)
                .collect();
            let joined: HashSet<&str> = joins.iter().map(|j| j.target_column.as_str()).collect();
            if joined != target_pk {
                return Err(invalid(format!(
                    "to-one relationship {}.{} must join on the primary key of {}",
                    source.name, rel.name, target.name
                )));
            }
        }

        match (&rel.reverse, &rel.kind) {
            (Some(reverse), kind) => {
                let reverse_rel = self.relationship(&target.name, reverse).map_err(|_| {
                    invalid(format!(
                        "reverse {} of {}.{} not found on {}",
                        reverse, source.name, rel.name, target.name
                    ))
                })?;
                if matches!(kind, RelationshipKind::ToMany { .. }) && !reverse_rel.is_to_one() {
                    return Err(invalid(format!(
                        "reverse of to-many {}.{} must be to-one",
                        source.name, rel.name
                    )));
                }
            }
            (None, RelationshipKind::ToMany { .. }) => {
                return Err(invalid(format!(
                    "to-many relationship {}.{} needs a to-one reverse",
                    source.name, rel.name
                )));
            }
            (None, _) => {}
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities.get(name).ok_or_else(|| GraphError::UnknownEntity {
            entity: name.to_string(),
        })
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Descriptors from the hierarchy root down to `name`
    fn ancestry(&self, name: &str) -> Result<Vec<&EntityDescriptor>> {
        let mut current = self.entity(name)?;
        let mut chain = vec![current];
        let mut seen = HashSet::new();
        seen.insert(name.to_string());
        while let Some(super_name) = current.super_entity.as_deref() {
            if !seen.insert(super_name.to_string()) {
                return Err(invalid(format!("inheritance cycle through {}", super_name)));
            }
            let parent = self.entities.get(super_name).ok_or_else(|| {
                invalid(format!("{} extends unknown entity {}", name, super_name))
            })?;
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// `name` and every entity inheriting from it, parents before children
    fn descendants(&self, name: &str) -> Vec<&EntityDescriptor> {
        let mut found: Vec<&EntityDescriptor> = Vec::new();
        let mut frontier = vec![name];
        while let Some(current) = frontier.pop() {
            if let Some(descriptor) = self.entities.get(current) {
                found.push(descriptor);
            }
            for child in self.entities.values() {
                if child.super_entity.as_deref() == Some(current) {
                    frontier.push(&child.name);
                }
            }
        }
        found
    }

    pub fn root_entity(&self, name: &str) -> Result<&EntityDescriptor> {
        Ok(self.ancestry(name)?[0])
    }

    pub fn is_subentity_of(&self, entity: &str, ancestor: &str) -> bool {
        self.ancestry(entity)
            .map(|chain| chain.iter().any(|d| d.name == ancestor))
            .unwrap_or(false)
    }

    pub fn table(&self, name: &str) -> Result<&str> {
        Ok(&self.root_entity(name)?.table)
    }

    pub fn pk_columns(&self, name: &str) -> Result<&[String]> {
        Ok(&self.root_entity(name)?.pk_columns)
    }

    pub fn generates_key(&self, name: &str) -> Result<bool> {
        Ok(self.root_entity(name)?.generated_key)
    }

    /// Attributes including inherited ones, super-entity attributes first
    pub fn attributes(&self, name: &str) -> Result<Vec<&Attribute>> {
        Ok(self
            .ancestry(name)?
            .into_iter()
            .flat_map(|d| d.attributes.iter())
            .collect())
    }

    pub fn attribute(&self, entity: &str, name: &str) -> Result<&Attribute> {
        self.ancestry(entity)?
            .into_iter()
            .rev()
            .find_map(|d| d.declared_attribute(name))
            .ok_or_else(|| GraphError::UnknownProperty {
                entity: entity.to_string(),
                property: name.to_string(),
            })
    }

    pub fn relationships(&self, name: &str) -> Result<Vec<&Relationship>> {
        Ok(self
            .ancestry(name)?
            .into_iter()
            .flat_map(|d| d.relationships.iter())
            .collect())
    }

    pub fn relationship(&self, entity: &str, name: &str) -> Result<&Relationship> {
        self.ancestry(entity)?
            .into_iter()
            .rev()
            .find_map(|d| d.declared_relationship(name))
            .ok_or_else(|| GraphError::UnknownProperty {
                entity: entity.to_string(),
                property: name.to_string(),
            })
    }

    /// Reverse relationship of `rel`, if mapped
    pub fn reverse_of(&self, rel: &Relationship) -> Result<Option<&Relationship>> {
        match &rel.reverse {
            Some(reverse) => self.relationship(&rel.target, reverse).map(Some),
            None => Ok(None),
        }
    }

    pub fn lock_type(&self, name: &str) -> Result<LockType> {
        let optimistic = self
            .ancestry(name)?
            .iter()
            .any(|d| d.lock_type == LockType::Optimistic);
        Ok(if optimistic {
            LockType::Optimistic
        } else {
            LockType::None
        })
    }

    /// Columns compared against their captured values on update and delete;
    /// empty when the entity is not optimistically locked
    pub fn locking_columns(&self, name: &str) -> Result<Vec<String>> {
        if self.lock_type(name)? != LockType::Optimistic {
            return Ok(Vec::new());
        }
        let mut columns: Vec<String> = self
            .attributes(name)?
            .into_iter()
            .filter(|a| a.used_for_locking)
            .map(|a| a.column.clone())
            .collect();
        for rel in self.relationships(name)? {
            if let (true, RelationshipKind::ToOne { joins }) = (rel.used_for_locking, &rel.kind) {
                for join in joins {
                    if !columns.contains(&join.source_column) {
                        columns.push(join.source_column.clone());
                    }
                }
            }
        }
        Ok(columns)
    }

    /// Identity of the row, tagged with the hierarchy root
    pub fn object_id_from_row(&self, entity: &str, row: &Row) -> Result<ObjectId> {
        let root = self.root_entity(entity)?;
        let mut key = BTreeMap::new();
        for column in &root.pk_columns {
            match row.get(column) {
                Some(value) if !value.is_null() => {
                    key.insert(column.clone(), value.clone());
                }
                _ => {
                    return Err(GraphError::Storage {
                        message: format!("row of {} lacks primary key column {}", entity, column),
                    })
                }
            }
        }
        Ok(ObjectId::permanent(root.name.clone(), key))
    }

    /// Most specific entity under `entity` whose discriminator matches the row
    pub fn entity_for_row<'a>(&'a self, entity: &'a str, row: &Row) -> &'a str {
        let mut best: Option<(usize, &'a str)> = None;
        for descriptor in self.descendants(entity) {
            if let Some(d) = &descriptor.discriminator {
                if row.get(&d.column) == Some(&d.value) {
                    let depth = self.ancestry(&descriptor.name).map(|c| c.len()).unwrap_or(0);
                    if best.map_or(true, |(b, _)| depth > b) {
                        best = Some((depth, descriptor.name.as_str()));
                    }
                }
            }
        }
        best.map(|(_, name)| name).unwrap_or(entity)
    }

    /// Qualifier restricting a table scan to rows of `entity` and its subentities
    pub fn entity_qualifier(&self, entity: &str) -> Result<Qualifier> {
        let descriptor = self.entity(entity)?;
        let Some(own) = &descriptor.discriminator else {
            return Ok(Qualifier::All);
        };
        let values: Vec<Value> = self
            .descendants(entity)
            .into_iter()
            .filter_map(|d| d.discriminator.as_ref())
            .filter(|d| d.column == own.column)
            .map(|d| d.value.clone())
            .collect();
        Ok(Qualifier::In(own.column.clone(), values))
    }

    /// Discriminator columns an insert of `entity` must carry
    pub fn discriminator_values(&self, entity: &str) -> Result<Row> {
        let mut row = Row::new();
        for descriptor in self.ancestry(entity)? {
            if let Some(d) = &descriptor.discriminator {
                row.insert(d.column.clone(), d.value.clone());
            }
        }
        Ok(row)
    }

    /// Target identity of a to-one relationship read from the source row's
    /// foreign key columns; `None` when any of them is null or absent
    pub fn target_id(&self, rel: &Relationship, row: &Row) -> Result<Option<ObjectId>> {
        let RelationshipKind::ToOne { joins } = &rel.kind else {
            return Err(invalid(format!("{} is not a to-one relationship", rel.name)));
        };
        let root = self.root_entity(&rel.target)?;
        let mut key = BTreeMap::new();
        for join in joins {
            match row.get(&join.source_column) {
                Some(value) if !value.is_null() => {
                    key.insert(join.target_column.clone(), value.clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(ObjectId::permanent(root.name.clone(), key)))
    }
}
