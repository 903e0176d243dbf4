//! Storage collaborator contracts
//!
//! The cache never talks to storage directly. It issues [`Query`]
//! descriptors to a [`RowSource`] and ordered [`WriteBatch`]es to a
//! [`WriteTransaction`] obtained from a [`WriteSink`]. Both sides speak in
//! entity and relationship names plus flat column rows; mapping those to
//! tables and joins is the collaborator's concern.

use thiserror::Error;

use crate::model::{ObjectId, Row, Value};

/// Column prefix under which a related-rows fetch reports the source key
pub const SOURCE_KEY_PREFIX: &str = "@source.";

/// Row filter
#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Rows whose `columns` tuple equals one of `keys`
    KeyIn {
        columns: Vec<String>,
        keys: Vec<Vec<Value>>,
    },
    IsNull(String),
    And(Vec<Qualifier>),
}

impl Qualifier {
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Qualifier::Eq(column.into(), value.into())
    }

    /// Combine two qualifiers, dropping `All` operands
    pub fn and(self, other: Qualifier) -> Qualifier {
        match (self, other) {
            (Qualifier::All, q) | (q, Qualifier::All) => q,
            (Qualifier::And(mut left), Qualifier::And(right)) => {
                left.extend(right);
                Qualifier::And(left)
            }
            (Qualifier::And(mut left), q) => {
                left.push(q);
                Qualifier::And(left)
            }
            (q, Qualifier::And(mut right)) => {
                right.insert(0, q);
                Qualifier::And(right)
            }
            (a, b) => Qualifier::And(vec![a, b]),
        }
    }

    /// Evaluate against a row; absent columns read as `Null`
    pub fn matches(&self, row: &Row) -> bool {
        let get = |column: &str| row.get(column).unwrap_or(&Value::Null);
        match self {
            Qualifier::All => true,
            Qualifier::Eq(column, value) => !value.is_null() && get(column) == value,
            Qualifier::In(column, values) => values.contains(get(column)),
            Qualifier::KeyIn { columns, keys } => keys.iter().any(|key| {
                key.len() == columns.len() && columns.iter().zip(key).all(|(c, v)| get(c) == v)
            }),
            Qualifier::IsNull(column) => get(column).is_null(),
            Qualifier::And(parts) => parts.iter().all(|q| q.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub column: String,
    pub order: SortOrder,
}

impl Ordering {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Descending,
        }
    }
}

/// Root select over one entity
///
/// `joint_paths` lists dotted relationship paths to outer-join into the same
/// result. Columns of a joined entity come back prefixed with its path and a
/// dot (`"exhibitArray.EXHIBIT_ID"`); a parent without children yields one
/// row with those columns absent or null. `limit` and `offset` apply to the
/// joined rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub entity: String,
    pub qualifier: Qualifier,
    pub orderings: Vec<Ordering>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub joint_paths: Vec<String>,
}

impl SelectQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            orderings: Vec::new(),
            limit: None,
            offset: 0,
            joint_paths: Vec::new(),
        }
    }
}

/// Targets of one relationship for a set of source identities
///
/// Every returned row carries the source's primary key under
/// [`SOURCE_KEY_PREFIX`]-prefixed columns so results can be grouped by
/// source.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedQuery {
    pub source_entity: String,
    pub relationship: String,
    pub source_ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(SelectQuery),
    Related(RelatedQuery),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Unknown table or entity: {0}")]
    UnknownTable(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Conflicting concurrent write: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Producer of flat rows for query descriptors
pub trait RowSource: Send + Sync {
    /// Run a query; rows come back in storage order after orderings,
    /// offset and limit are applied
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` when the query cannot be executed.
    fn fetch(&self, query: &Query) -> Result<Vec<Row>, StorageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// `values` carry every column to write; when `generate_key` is set the
    /// storage fills the primary key and reports it back
    Insert {
        entity: String,
        id: ObjectId,
        values: Row,
        generate_key: bool,
    },
    /// `qualifier` lists key and lock columns with the values they must
    /// still hold; a `Null` qualifier value means IS NULL
    Update {
        entity: String,
        id: ObjectId,
        values: Row,
        qualifier: Row,
        check_row_count: bool,
    },
    Delete {
        entity: String,
        id: ObjectId,
        qualifier: Row,
        check_row_count: bool,
    },
    JoinInsert {
        table: String,
        values: Row,
    },
    JoinDelete {
        table: String,
        values: Row,
    },
}

impl WriteOp {
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            WriteOp::Insert { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id, .. } => {
                Some(id)
            }
            WriteOp::JoinInsert { .. } | WriteOp::JoinDelete { .. } => None,
        }
    }
}

/// Ordered operations executed together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Per-operation feedback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpResult {
    pub affected: usize,
    /// Key columns the storage generated for an insert
    pub generated_key: Option<Row>,
}

pub trait WriteTransaction: Send {
    /// Execute a batch; results line up with `batch.ops`
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if any operation fails.
    fn execute(&mut self, batch: &WriteBatch) -> Result<Vec<OpResult>, StorageError>;

    /// # Errors
    ///
    /// Returns a `StorageError` if the writes cannot be made durable.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    fn rollback(self: Box<Self>);
}

pub trait WriteSink: Send + Sync {
    /// # Errors
    ///
    /// Returns a `StorageError` if no transaction can be started.
    fn begin(&self) -> Result<Box<dyn WriteTransaction>, StorageError>;
}
