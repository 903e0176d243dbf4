//! Entity descriptors
//!
//! A descriptor is the tagged-variant description of one mapped entity: its
//! table, key, attributes and relationships. Descriptors are plain data built
//! with a small builder API and validated together by
//! [`EntityResolver`](super::EntityResolver).

use serde::{Deserialize, Serialize};

use super::Value;

/// Mapped attribute: property name to column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub column: String,
    /// Included in the optimistic lock qualifier
    pub used_for_locking: bool,
}

/// One column pair of a join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub source_column: String,
    pub target_column: String,
}

impl Join {
    pub fn new(source_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

fn joins<I, A, B>(pairs: I) -> Vec<Join>
where
    I: IntoIterator<Item = (A, B)>,
    A: Into<String>,
    B: Into<String>,
{
    pairs.into_iter().map(|(s, t)| Join::new(s, t)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Source row holds the foreign key; joins go source FK -> target PK
    ToOne { joins: Vec<Join> },
    /// Target rows hold the foreign key; joins go source PK -> target FK
    ToMany { joins: Vec<Join> },
    /// Many-to-many through a join table. `source_joins` go source PK -> join
    /// table column, `target_joins` go join table column -> target PK.
    Flattened {
        join_table: String,
        source_joins: Vec<Join>,
        target_joins: Vec<Join>,
    },
}

/// What happens to related objects when the source object is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Refuse the delete while related objects exist
    Deny,
    /// Clear the foreign key or join rows first
    Nullify,
    /// Delete related objects first
    Cascade,
    #[default]
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    pub kind: RelationshipKind,
    pub delete_rule: DeleteRule,
    /// To-one only: foreign key columns join the lock qualifier
    pub used_for_locking: bool,
    /// Name of the reverse relationship on the target entity
    pub reverse: Option<String>,
}

impl Relationship {
    pub fn to_one<I, A, B>(name: impl Into<String>, target: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self::with_kind(name, target, RelationshipKind::ToOne { joins: joins(pairs) })
    }

    pub fn to_many<I, A, B>(name: impl Into<String>, target: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self::with_kind(name, target, RelationshipKind::ToMany { joins: joins(pairs) })
    }

    pub fn flattened<I, J, A, B, C, D>(
        name: impl Into<String>,
        target: impl Into<String>,
        join_table: impl Into<String>,
        source_pairs: I,
        target_pairs: J,
    ) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        J: IntoIterator<Item = (C, D)>,
        A: Into<String>,
        B: Into<String>,
        C: Into<String>,
        D: Into<String>,
    {
        Self::with_kind(
            name,
            target,
            RelationshipKind::Flattened {
                join_table: join_table.into(),
                source_joins: joins(source_pairs),
                target_joins: joins(target_pairs),
            },
        )
    }

    fn with_kind(name: impl Into<String>, target: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            delete_rule: DeleteRule::NoAction,
            used_for_locking: false,
            reverse: None,
        }
    }

    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, RelationshipKind::ToOne { .. })
    }

    pub fn is_flattened(&self) -> bool {
        matches!(self.kind, RelationshipKind::Flattened { .. })
    }

    /// To-many and flattened relationships both hold a list of targets
    pub fn is_to_many(&self) -> bool {
        !self.is_to_one()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockType {
    #[default]
    None,
    Optimistic,
}

/// Column/value pair selecting the rows of one entity in a shared table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discriminator {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    /// Table name; subentities store their rows in the root's table
    pub table: String,
    pub pk_columns: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub relationships: Vec<Relationship>,
    pub lock_type: LockType,
    pub super_entity: Option<String>,
    pub discriminator: Option<Discriminator>,
    /// Storage generates the primary key on insert
    pub generated_key: bool,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            pk_columns: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            lock_type: LockType::None,
            super_entity: None,
            discriminator: None,
            generated_key: false,
        }
    }

    /// Subentity sharing the table of `super_entity`
    pub fn subentity(name: impl Into<String>, super_entity: impl Into<String>) -> Self {
        let mut descriptor = Self::new(name, String::new());
        descriptor.super_entity = Some(super_entity.into());
        descriptor
    }

    pub fn pk(mut self, column: impl Into<String>) -> Self {
        self.pk_columns.push(column.into());
        self
    }

    pub fn generated_key(mut self) -> Self {
        self.generated_key = true;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            column: column.into(),
            used_for_locking: false,
        });
        self
    }

    /// Attribute that joins the optimistic lock qualifier; switches the entity
    /// to optimistic locking
    pub fn locking_attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            column: column.into(),
            used_for_locking: true,
        });
        self.lock_type = LockType::Optimistic;
        self
    }

    pub fn optimistic_lock(mut self) -> Self {
        self.lock_type = LockType::Optimistic;
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.discriminator = Some(Discriminator {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn declared_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn declared_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_attributes_and_relationships() {
        let artist = EntityDescriptor::new("Artist", "ARTIST")
            .pk("ARTIST_ID")
            .generated_key()
            .locking_attribute("artistName", "ARTIST_NAME")
            .relationship(
                Relationship::to_many("paintingArray", "Painting", [("ARTIST_ID", "ARTIST_ID")])
                    .delete_rule(DeleteRule::Nullify)
                    .reverse("toArtist"),
            );

        assert_eq!(artist.lock_type, LockType::Optimistic);
        assert!(artist.declared_attribute("artistName").is_some());
        let rel = artist.declared_relationship("paintingArray").unwrap();
        assert!(rel.is_to_many());
        assert_eq!(rel.delete_rule, DeleteRule::Nullify);
        assert_eq!(rel.reverse.as_deref(), Some("toArtist"));
    }

    #[test]
    fn test_flattened_is_to_many() {
        let rel = Relationship::flattened(
            "groupArray",
            "ArtGroup",
            "ARTIST_GROUP",
            [("ARTIST_ID", "ARTIST_ID")],
            [("GROUP_ID", "GROUP_ID")],
        );
        assert!(rel.is_flattened());
        assert!(rel.is_to_many());
        assert!(!rel.is_to_one());
    }
}
