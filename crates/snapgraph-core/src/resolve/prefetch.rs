//! Disjoint and disjoint-by-id prefetching
//!
//! Each path step runs against the objects the previous step produced.
//! Sources that match nothing still get a resolved, empty arc on the last
//! step, so a prefetched relationship never reads as a fault.

use std::collections::{BTreeMap, HashMap};

use indexmap::{IndexMap, IndexSet};

use super::select::PrefetchSemantics;
use crate::collab::{Qualifier, Query, RelatedQuery, SelectQuery, SOURCE_KEY_PREFIX};
use crate::errors::Result;
use crate::graph::ObjectHandle;
use crate::model::{EntityResolver, ObjectId, Relationship, Row, Value};
use crate::session::Session;

/// Identity of the source a related row was fetched for
fn source_id(resolver: &EntityResolver, source_entity: &str, row: &Row) -> Result<Option<ObjectId>> {
    let root = resolver.root_entity(source_entity)?;
    let mut key = BTreeMap::new();
    for column in &root.pk_columns {
        match row.get(&format!("{}{}", SOURCE_KEY_PREFIX, column)) {
            Some(value) if !value.is_null() => {
                key.insert(column.clone(), value.clone());
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(ObjectId::permanent(root.name.clone(), key)))
}

impl Session {
    pub(crate) fn prefetch_disjoint(
        &mut self,
        entity: &str,
        roots: &[ObjectHandle],
        path: &str,
        semantics: PrefetchSemantics,
        group: Option<&str>,
    ) -> Result<()> {
        let resolver = self.resolver();
        let segments: Vec<&str> = path.split('.').collect();
        let mut sources: Vec<ObjectHandle> = roots
            .iter()
            .copied()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        let mut current_entity = entity.to_string();

        for (depth, segment) in segments.iter().enumerate() {
            let rel = resolver.relationship(&current_entity, segment)?.clone();
            let grouped = match (semantics, rel.is_to_one()) {
                (PrefetchSemantics::DisjointById, true) => {
                    self.fetch_to_one_by_id(&rel, &sources, group)?
                }
                (PrefetchSemantics::DisjointById, false) => {
                    let batch = self.runtime.config.max_id_qualifier_size;
                    self.fetch_related(&current_entity, &rel, &sources, batch, group)?
                }
                _ => self.fetch_related(&current_entity, &rel, &sources, usize::MAX, group)?,
            };

            let mut next: IndexSet<ObjectHandle> = IndexSet::new();
            for members in grouped.values() {
                for id in members {
                    next.insert(self.target_handle(id)?);
                }
            }
            if depth + 1 == segments.len() {
                for (source, members) in grouped {
                    self.attach_members(source, segment, members.into_iter().collect())?;
                }
            }
            sources = next.into_iter().collect();
            current_entity = rel.target.clone();
        }
        Ok(())
    }

    /// Related-rows queries over `sources`, `batch` source keys at a time
    fn fetch_related(
        &mut self,
        source_entity: &str,
        rel: &Relationship,
        sources: &[ObjectHandle],
        batch: usize,
        group: Option<&str>,
    ) -> Result<IndexMap<ObjectHandle, IndexSet<ObjectId>>> {
        let resolver = self.resolver();
        let mut grouped: IndexMap<ObjectHandle, IndexSet<ObjectId>> = IndexMap::new();
        let mut by_id: HashMap<ObjectId, ObjectHandle> = HashMap::new();
        let mut ids: Vec<ObjectId> = Vec::with_capacity(sources.len());
        for handle in sources {
            let id = self.graph.get(*handle)?.id.clone();
            if id.is_temporary() {
                continue;
            }
            grouped.insert(*handle, IndexSet::new());
            by_id.insert(id.clone(), *handle);
            ids.push(id);
        }

        for chunk in ids.chunks(batch.max(1)) {
            let query = Query::Related(RelatedQuery {
                source_entity: source_entity.to_string(),
                relationship: rel.name.clone(),
                source_ids: chunk.to_vec(),
            });
            let rows = self.runtime.source.fetch(&query)?;
            let targets = self.hydrate_rows(&rel.target, &rows, group)?;
            for (row, target) in rows.iter().zip(targets) {
                let Some(source) = source_id(&resolver, source_entity, row)? else {
                    continue;
                };
                let Some(handle) = by_id.get(&source) else {
                    continue;
                };
                let target_id = self.graph.get(target)?.id.clone();
                grouped.entry(*handle).or_default().insert(target_id);
            }
        }
        Ok(grouped)
    }

    /// Fetch to-one targets by primary key, each distinct target once
    fn fetch_to_one_by_id(
        &mut self,
        rel: &Relationship,
        sources: &[ObjectHandle],
        group: Option<&str>,
    ) -> Result<IndexMap<ObjectHandle, IndexSet<ObjectId>>> {
        let resolver = self.resolver();
        let batch = self.runtime.config.max_id_qualifier_size.max(1);
        let mut wanted: IndexMap<ObjectHandle, Option<ObjectId>> = IndexMap::new();
        for handle in sources {
            self.ensure(*handle, super::Need::Attributes)?;
            let object = self.graph.get(*handle)?;
            if object.id.is_temporary() {
                continue;
            }
            wanted.insert(*handle, resolver.target_id(rel, object.current_row())?);
        }

        let distinct: Vec<ObjectId> = wanted
            .values()
            .flatten()
            .cloned()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        let pk = resolver.pk_columns(&rel.target)?.to_vec();
        for chunk in distinct.chunks(batch) {
            let keys = chunk
                .iter()
                .map(|id| {
                    pk.iter()
                        .map(|c| id.key_value(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            let mut query = SelectQuery::new(rel.target.clone());
            query.qualifier = resolver.entity_qualifier(&rel.target)?.and(Qualifier::KeyIn {
                columns: pk.clone(),
                keys,
            });
            let rows = self.runtime.source.fetch(&Query::Select(query))?;
            self.hydrate_rows(&rel.target, &rows, group)?;
        }

        Ok(wanted
            .into_iter()
            .map(|(source, target)| (source, target.into_iter().collect()))
            .collect())
    }
}
