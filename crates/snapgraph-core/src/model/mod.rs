//! Mapping and value model: values, rows, identities and entity descriptors

pub mod entity;
pub mod object_id;
pub mod resolver;
pub mod value;

pub use entity::{
    Attribute, DeleteRule, Discriminator, EntityDescriptor, Join, LockType, Relationship,
    RelationshipKind,
};
pub use object_id::{IdKey, ObjectId};
pub use resolver::EntityResolver;
pub use value::{row, Row, Value};
