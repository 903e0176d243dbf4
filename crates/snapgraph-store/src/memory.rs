//! In-memory row storage
//!
//! Tables are plain row vectors keyed by table name. Queries are answered
//! from the mapping held by an [`EntityResolver`], so the storage
//! understands relationship joins, discriminators and joint prefetch paths
//! without any query language.
//!
//! Write transactions work on a private copy of all tables and swap it in
//! on commit. A commit fails with `StorageError::Conflict` when anything
//! else committed (or an out-of-band helper wrote) after the transaction
//! began.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use snapgraph_core::collab::{
    OpResult, Qualifier, Query, RelatedQuery, RowSource, SelectQuery, SortOrder, StorageError,
    WriteBatch, WriteOp, WriteSink, WriteTransaction, SOURCE_KEY_PREFIX,
};
use snapgraph_core::model::{EntityResolver, ObjectId, Relationship, RelationshipKind, Row, Value};
use tracing::debug;

type Tables = IndexMap<String, Vec<Row>>;

#[derive(Debug, Default)]
struct Data {
    /// Bumped by every committed transaction and out-of-band write
    generation: u64,
    tables: Tables,
}

#[derive(Debug)]
struct Inner {
    resolver: Arc<EntityResolver>,
    data: RwLock<Data>,
    sequences: Mutex<HashMap<String, i64>>,
    write_log: Mutex<Vec<WriteOp>>,
    fail_next_write: Mutex<Option<StorageError>>,
    fetches: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
}

/// Storage collaborator keeping every table in memory
///
/// Cloning is cheap and every clone sees the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

fn unknown_table(name: &str) -> StorageError {
    StorageError::UnknownTable(name.to_string())
}

fn unknown_entity(name: &str) -> StorageError {
    StorageError::UnknownTable(format!("no table for entity {}", name))
}

fn matches_all(row: &Row, qualifier: &Row) -> bool {
    qualifier
        .iter()
        .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
}

fn value_of<'a>(row: &'a Row, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&Value::Null)
}

impl MemoryStorage {
    /// Empty storage with one table per root entity and per join table
    pub fn new(resolver: Arc<EntityResolver>) -> Self {
        let mut tables = Tables::new();
        for name in resolver.entity_names() {
            if let Ok(table) = resolver.table(name) {
                tables.entry(table.to_string()).or_default();
            }
            if let Ok(entity) = resolver.entity(name) {
                for rel in &entity.relationships {
                    if let RelationshipKind::Flattened { join_table, .. } = &rel.kind {
                        tables.entry(join_table.clone()).or_default();
                    }
                }
            }
        }
        Self {
            inner: Arc::new(Inner {
                resolver,
                data: RwLock::new(Data {
                    generation: 0,
                    tables,
                }),
                sequences: Mutex::new(HashMap::new()),
                write_log: Mutex::new(Vec::new()),
                fail_next_write: Mutex::new(None),
                fetches: AtomicUsize::new(0),
                begins: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.inner.resolver
    }

    /// Insert a row directly, outside of any transaction
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for an unmapped table.
    pub fn insert_row(&self, table: &str, row: Row) -> Result<(), StorageError> {
        let mut data = self.inner.data.write();
        let rows = data.tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        rows.push(row);
        data.generation += 1;
        Ok(())
    }

    /// Update rows matching every column of `qualifier`, outside of any
    /// transaction; returns the number of rows changed
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for an unmapped table.
    pub fn update_rows(&self, table: &str, qualifier: &Row, values: &Row) -> Result<usize, StorageError> {
        let mut data = self.inner.data.write();
        let rows = data.tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        let mut affected = 0;
        for row in rows.iter_mut().filter(|r| matches_all(r, qualifier)) {
            row.extend(values.clone());
            affected += 1;
        }
        data.generation += 1;
        Ok(affected)
    }

    /// Delete rows matching every column of `qualifier`, outside of any
    /// transaction; returns the number of rows removed
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for an unmapped table.
    pub fn delete_rows(&self, table: &str, qualifier: &Row) -> Result<usize, StorageError> {
        let mut data = self.inner.data.write();
        let rows = data.tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        let before = rows.len();
        rows.retain(|r| !matches_all(r, qualifier));
        let affected = before - rows.len();
        data.generation += 1;
        Ok(affected)
    }

    /// Current rows of a table, in insertion order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .data
            .read()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `fetch` calls since creation or the last reset
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Number of transactions begun since creation or the last reset
    pub fn transaction_count(&self) -> usize {
        self.inner.begins.load(Ordering::SeqCst)
    }

    /// Number of transactions committed since creation or the last reset
    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.inner.fetches.store(0, Ordering::SeqCst);
        self.inner.begins.store(0, Ordering::SeqCst);
        self.inner.commits.store(0, Ordering::SeqCst);
        self.inner.write_log.lock().clear();
    }

    /// Every operation of every committed transaction, in execution order
    pub fn write_log(&self) -> Vec<WriteOp> {
        self.inner.write_log.lock().clone()
    }

    /// Make the next executed batch fail with `error`
    pub fn fail_next_write(&self, error: StorageError) {
        *self.inner.fail_next_write.lock() = Some(error);
    }
}

impl Inner {
    fn table_of(&self, entity: &str) -> Result<String, StorageError> {
        self.resolver
            .table(entity)
            .map(str::to_string)
            .map_err(|_| unknown_entity(entity))
    }

    fn entity_qualifier(&self, entity: &str) -> Result<Qualifier, StorageError> {
        self.resolver
            .entity_qualifier(entity)
            .map_err(|_| unknown_entity(entity))
    }

    fn relationship(&self, entity: &str, name: &str) -> Result<Relationship, StorageError> {
        self.resolver
            .relationship(entity, name)
            .cloned()
            .map_err(|e| StorageError::UnknownTable(e.to_string()))
    }

    /// Rows of `rel.target` related to one source row
    fn related_rows(&self, tables: &Tables, rel: &Relationship, source: &Row) -> Result<Vec<Row>, StorageError> {
        let table = self.table_of(&rel.target)?;
        let target_rows = tables.get(&table).ok_or_else(|| unknown_table(&table))?;
        let in_entity = self.entity_qualifier(&rel.target)?;

        let found: Vec<Row> = match &rel.kind {
            RelationshipKind::ToOne { joins } | RelationshipKind::ToMany { joins } => {
                if joins.iter().any(|j| value_of(source, &j.source_column).is_null()) {
                    return Ok(Vec::new());
                }
                target_rows
                    .iter()
                    .filter(|row| {
                        joins
                            .iter()
                            .all(|j| value_of(row, &j.target_column) == value_of(source, &j.source_column))
                    })
                    .cloned()
                    .collect()
            }
            RelationshipKind::Flattened {
                join_table,
                source_joins,
                target_joins,
            } => {
                let links = tables.get(join_table).ok_or_else(|| unknown_table(join_table))?;
                let mut found = Vec::new();
                for link in links.iter().filter(|link| {
                    source_joins
                        .iter()
                        .all(|j| value_of(link, &j.target_column) == value_of(source, &j.source_column))
                }) {
                    found.extend(
                        target_rows
                            .iter()
                            .filter(|row| {
                                target_joins.iter().all(|j| {
                                    value_of(row, &j.target_column) == value_of(link, &j.source_column)
                                })
                            })
                            .cloned(),
                    );
                }
                found
            }
        };
        Ok(found.into_iter().filter(|row| in_entity.matches(row)).collect())
    }

    fn find_by_id<'a>(&self, tables: &'a Tables, id: &ObjectId) -> Result<Option<&'a Row>, StorageError> {
        let table = self.table_of(id.entity())?;
        let rows = tables.get(&table).ok_or_else(|| unknown_table(&table))?;
        let Some(key) = id.key_values() else {
            return Ok(None);
        };
        Ok(rows
            .iter()
            .find(|row| key.iter().all(|(column, value)| value_of(row, column) == value)))
    }

    fn select(&self, tables: &Tables, query: &SelectQuery) -> Result<Vec<Row>, StorageError> {
        let table = self.table_of(&query.entity)?;
        let rows = tables.get(&table).ok_or_else(|| unknown_table(&table))?;
        let mut matched: Vec<Row> = rows
            .iter()
            .filter(|row| query.qualifier.matches(row))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            query
                .orderings
                .iter()
                .map(|o| {
                    let ord = value_of(a, &o.column).cmp(value_of(b, &o.column));
                    match o.order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    }
                })
                .find(|ord| *ord != CmpOrdering::Equal)
                .unwrap_or(CmpOrdering::Equal)
        });

        let mut joined = Vec::with_capacity(matched.len());
        for root in matched {
            let mut combined = vec![root.clone()];
            for path in &query.joint_paths {
                let fanned = self.expand_path(tables, &query.entity, &root, path)?;
                combined = combined
                    .into_iter()
                    .flat_map(|row| {
                        fanned.iter().map(move |extra| {
                            let mut row = row.clone();
                            row.extend(extra.clone());
                            row
                        })
                    })
                    .collect();
            }
            joined.extend(combined);
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(joined.into_iter().skip(query.offset).take(limit).collect())
    }

    /// Outer join of one dotted path from a root row; every returned row
    /// holds only the path-prefixed columns. A step with no match yields
    /// one row without columns for that step.
    fn expand_path(&self, tables: &Tables, entity: &str, root: &Row, path: &str) -> Result<Vec<Row>, StorageError> {
        let mut frontier: Vec<(Row, Option<Row>)> = vec![(Row::new(), Some(root.clone()))];
        let mut current_entity = entity.to_string();
        let mut prefix = String::new();
        for segment in path.split('.') {
            let rel = self.relationship(&current_entity, segment)?;
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);

            let mut next = Vec::new();
            for (columns, source) in frontier {
                let related = match &source {
                    Some(source) => self.related_rows(tables, &rel, source)?,
                    None => Vec::new(),
                };
                if related.is_empty() {
                    next.push((columns, None));
                    continue;
                }
                for target in related {
                    let mut columns = columns.clone();
                    for (column, value) in &target {
                        columns.insert(format!("{}.{}", prefix, column), value.clone());
                    }
                    next.push((columns, Some(target)));
                }
            }
            frontier = next;
            current_entity = rel.target.clone();
        }
        Ok(frontier.into_iter().map(|(columns, _)| columns).collect())
    }

    fn related(&self, tables: &Tables, query: &RelatedQuery) -> Result<Vec<Row>, StorageError> {
        let rel = self.relationship(&query.source_entity, &query.relationship)?;
        let mut out = Vec::new();
        for id in &query.source_ids {
            let Some(source) = self.find_by_id(tables, id)? else {
                continue;
            };
            let tag: Vec<(String, Value)> = id
                .key_values()
                .into_iter()
                .flatten()
                .map(|(column, value)| (format!("{}{}", SOURCE_KEY_PREFIX, column), value.clone()))
                .collect();
            for mut row in self.related_rows(tables, &rel, source)? {
                row.extend(tag.iter().cloned());
                out.push(row);
            }
        }
        Ok(out)
    }

    fn next_key(&self, tables: &Tables, table: &str, column: &str) -> i64 {
        let stored = tables
            .get(table)
            .into_iter()
            .flatten()
            .filter_map(|row| value_of(row, column).as_i64())
            .max()
            .unwrap_or(0);
        let mut sequences = self.sequences.lock();
        let next = sequences.entry(table.to_string()).or_insert(0);
        *next = (*next).max(stored) + 1;
        *next
    }

    fn apply(&self, tables: &mut Tables, op: &WriteOp) -> Result<OpResult, StorageError> {
        match op {
            WriteOp::Insert {
                entity,
                values,
                generate_key,
                ..
            } => {
                let table = self.table_of(entity)?;
                let pk = self
                    .resolver
                    .pk_columns(entity)
                    .map_err(|_| unknown_entity(entity))?
                    .to_vec();
                let mut row = values.clone();
                let mut generated = None;
                if *generate_key {
                    let [column] = pk.as_slice() else {
                        return Err(StorageError::Constraint(format!(
                            "cannot generate a compound key for {}",
                            table
                        )));
                    };
                    let key = Value::Int(self.next_key(tables, &table, column));
                    row.insert(column.clone(), key.clone());
                    let mut generated_row = Row::new();
                    generated_row.insert(column.clone(), key);
                    generated = Some(generated_row);
                }
                if pk.iter().any(|c| value_of(&row, c).is_null()) {
                    return Err(StorageError::Constraint(format!("null primary key in {}", table)));
                }
                let rows = tables.get_mut(&table).ok_or_else(|| unknown_table(&table))?;
                if rows
                    .iter()
                    .any(|existing| pk.iter().all(|c| value_of(existing, c) == value_of(&row, c)))
                {
                    return Err(StorageError::Constraint(format!("duplicate primary key in {}", table)));
                }
                rows.push(row);
                Ok(OpResult {
                    affected: 1,
                    generated_key: generated,
                })
            }
            WriteOp::Update {
                entity,
                values,
                qualifier,
                ..
            } => {
                let table = self.table_of(entity)?;
                let rows = tables.get_mut(&table).ok_or_else(|| unknown_table(&table))?;
                let mut affected = 0;
                for row in rows.iter_mut().filter(|r| matches_all(r, qualifier)) {
                    row.extend(values.clone());
                    affected += 1;
                }
                Ok(OpResult {
                    affected,
                    generated_key: None,
                })
            }
            WriteOp::Delete {
                entity, qualifier, ..
            } => {
                let table = self.table_of(entity)?;
                let rows = tables.get_mut(&table).ok_or_else(|| unknown_table(&table))?;
                let before = rows.len();
                rows.retain(|r| !matches_all(r, qualifier));
                Ok(OpResult {
                    affected: before - rows.len(),
                    generated_key: None,
                })
            }
            WriteOp::JoinInsert { table, values } => {
                let rows = tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
                rows.push(values.clone());
                Ok(OpResult {
                    affected: 1,
                    generated_key: None,
                })
            }
            WriteOp::JoinDelete { table, values } => {
                let rows = tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
                let before = rows.len();
                rows.retain(|r| !matches_all(r, values));
                Ok(OpResult {
                    affected: before - rows.len(),
                    generated_key: None,
                })
            }
        }
    }
}

impl RowSource for MemoryStorage {
    fn fetch(&self, query: &Query) -> Result<Vec<Row>, StorageError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self.inner.data.read();
        let rows = match query {
            Query::Select(select) => self.inner.select(&data.tables, select)?,
            Query::Related(related) => self.inner.related(&data.tables, related)?,
        };
        debug!(
            component = module_path!(),
            row_count = rows.len(),
            "memory storage fetch"
        );
        Ok(rows)
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    base_generation: u64,
    working: Tables,
    executed: Vec<WriteOp>,
}

impl WriteTransaction for MemoryTransaction {
    fn execute(&mut self, batch: &WriteBatch) -> Result<Vec<OpResult>, StorageError> {
        if let Some(err) = self.inner.fail_next_write.lock().take() {
            return Err(err);
        }
        let mut results = Vec::with_capacity(batch.len());
        for op in &batch.ops {
            results.push(self.inner.apply(&mut self.working, op)?);
            self.executed.push(op.clone());
        }
        Ok(results)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction {
            inner,
            base_generation,
            working,
            executed,
        } = *self;
        let mut data = inner.data.write();
        if data.generation != base_generation {
            return Err(StorageError::Conflict(
                "tables changed since the transaction began".to_string(),
            ));
        }
        data.tables = working;
        data.generation += 1;
        inner.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            component = module_path!(),
            op_count = executed.len(),
            "memory transaction committed"
        );
        inner.write_log.lock().extend(executed);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!(
            component = module_path!(),
            op_count = self.executed.len(),
            "memory transaction rolled back"
        );
    }
}

impl WriteSink for MemoryStorage {
    fn begin(&self) -> Result<Box<dyn WriteTransaction>, StorageError> {
        self.inner.begins.fetch_add(1, Ordering::SeqCst);
        let data = self.inner.data.read();
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            base_generation: data.generation,
            working: data.tables.clone(),
            executed: Vec::new(),
        }))
    }
}
