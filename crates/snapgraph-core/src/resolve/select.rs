//! Root queries with prefetching

use std::collections::HashSet;
use std::time::Instant;

use indexmap::IndexMap;

use crate::collab::{Ordering, Qualifier, Query, SelectQuery};
use crate::errors::Result;
use crate::graph::{ArcValue, ObjectHandle};
use crate::model::{ObjectId, Row};
use crate::session::Session;
use crate::{log_op_end, log_op_error, log_op_start};

/// How a prefetched relationship path is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefetchSemantics {
    /// Outer-joined into the root query
    Joint,
    /// One related-rows query per path step, keyed by the sources
    Disjoint,
    /// Like `Disjoint`, but to-one steps fetch targets by primary key in
    /// batches of `max_id_qualifier_size`
    DisjointById,
}

/// Root query description
///
/// `limit` and `offset` are passed to storage as-is. With a joint to-many
/// prefetch they count joined rows, so fewer distinct roots than `limit`
/// may come back.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSpec {
    pub entity: String,
    pub qualifier: Qualifier,
    pub orderings: Vec<Ordering>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub prefetches: Vec<(String, PrefetchSemantics)>,
    /// Tag for the snapshots this query installs
    pub cache_group: Option<String>,
}

impl FetchSpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            orderings: Vec::new(),
            limit: None,
            offset: 0,
            prefetches: Vec::new(),
            cache_group: None,
        }
    }

    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn order_by(mut self, ordering: Ordering) -> Self {
        self.orderings.push(ordering);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Prefetch a dotted relationship path, e.g. `"paintingArray.toGallery"`
    pub fn prefetch(mut self, path: impl Into<String>, semantics: PrefetchSemantics) -> Self {
        self.prefetches.push((path.into(), semantics));
        self
    }

    pub fn cache_group(mut self, group: impl Into<String>) -> Self {
        self.cache_group = Some(group.into());
        self
    }
}

/// Columns of one joint path (`Some(path)`) or of the root (`None`)
fn split_columns(row: &Row, path: Option<&str>) -> Row {
    row.iter()
        .filter_map(|(column, value)| {
            let local = match path {
                None => (!column.contains('.')).then_some(column.as_str()),
                Some(path) => column
                    .strip_prefix(path)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .filter(|rest| !rest.contains('.')),
            }?;
            Some((local.to_string(), value.clone()))
        })
        .collect()
}

impl Session {
    /// Run a root query and return the matching objects in result order
    ///
    /// Prefetched relationships come back resolved on the returned objects
    /// (and on intermediate objects for the last step of each path);
    /// pending local edits of those relationships are replayed on top.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity`/`UnknownProperty` for a bad entity or path and
    /// `Storage` when the row source fails.
    pub fn select(&mut self, spec: &FetchSpec) -> Result<Vec<ObjectHandle>> {
        self.process_events();
        log_op_start!("select", session_id = %self.id, entity = %spec.entity);
        let start = Instant::now();

        let handles = self.select_impl(spec).map_err(|e| {
            log_op_error!(
                "select",
                e.clone(),
                session_id = &self.id,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "select",
            duration_ms = start.elapsed().as_millis() as u64,
            object_count = handles.len()
        );
        Ok(handles)
    }

    fn select_impl(&mut self, spec: &FetchSpec) -> Result<Vec<ObjectHandle>> {
        let resolver = self.resolver();
        resolver.entity(&spec.entity)?;
        for (path, _) in &spec.prefetches {
            let mut entity = spec.entity.clone();
            for segment in path.split('.') {
                entity = resolver.relationship(&entity, segment)?.target.clone();
            }
        }

        let joint_paths: Vec<String> = spec
            .prefetches
            .iter()
            .filter(|(_, semantics)| *semantics == PrefetchSemantics::Joint)
            .map(|(path, _)| path.clone())
            .collect();
        let query = SelectQuery {
            entity: spec.entity.clone(),
            qualifier: resolver
                .entity_qualifier(&spec.entity)?
                .and(spec.qualifier.clone()),
            orderings: spec.orderings.clone(),
            limit: spec.limit,
            offset: spec.offset,
            joint_paths: joint_paths.clone(),
        };
        let rows = self.runtime.source.fetch(&Query::Select(query))?;
        let group = spec.cache_group.as_deref();

        // joint fan-out repeats roots; keep the first occurrence
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut roots: Vec<Row> = Vec::new();
        for row in &rows {
            let root = split_columns(row, None);
            let id = resolver.object_id_from_row(&spec.entity, &root)?;
            if seen.insert(id) {
                roots.push(root);
            }
        }
        let handles = self.hydrate_rows(&spec.entity, &roots, group)?;

        if !joint_paths.is_empty() {
            self.attach_joint(&spec.entity, &rows, &joint_paths, group)?;
        }
        for (path, semantics) in &spec.prefetches {
            if *semantics != PrefetchSemantics::Joint {
                self.prefetch_disjoint(&spec.entity, &handles, path, *semantics, group)?;
            }
        }
        Ok(handles)
    }

    /// Hydrate the joined columns of every row and resolve the last step of
    /// each path on the objects that reached it
    fn attach_joint(
        &mut self,
        entity: &str,
        rows: &[Row],
        paths: &[String],
        group: Option<&str>,
    ) -> Result<()> {
        let resolver = self.resolver();
        for path in paths {
            let segments: Vec<&str> = path.split('.').collect();
            let Some(last_segment) = segments.last().copied() else {
                continue;
            };
            let mut arcs: IndexMap<ObjectHandle, Vec<ObjectId>> = IndexMap::new();

            for row in rows {
                let root_id = resolver.object_id_from_row(entity, &split_columns(row, None))?;
                let Some(mut source) = self.graph.lookup(&root_id) else {
                    continue;
                };
                let mut current_entity = entity.to_string();
                for (depth, segment) in segments.iter().enumerate() {
                    let rel = resolver.relationship(&current_entity, segment)?;
                    let prefix = segments[..=depth].join(".");
                    let child = split_columns(row, Some(&prefix));
                    let target = if resolver.object_id_from_row(&rel.target, &child).is_ok() {
                        self.hydrate_rows(&rel.target, &[child], group)?
                            .into_iter()
                            .next()
                    } else {
                        None
                    };
                    if depth + 1 == segments.len() {
                        let members = arcs.entry(source).or_default();
                        if let Some(target) = target {
                            let id = self.graph.get(target)?.id.clone();
                            if !members.contains(&id) {
                                members.push(id);
                            }
                        }
                    }
                    match target {
                        Some(next) => {
                            source = next;
                            current_entity = rel.target.clone();
                        }
                        None => break,
                    }
                }
            }

            for (source, members) in arcs {
                self.attach_members(source, last_segment, members)?;
            }
        }
        Ok(())
    }

    /// Resolve an arc from a list of fetched members
    pub(crate) fn attach_members(
        &mut self,
        source: ObjectHandle,
        relationship: &str,
        members: Vec<ObjectId>,
    ) -> Result<()> {
        let object = self.graph.get(source)?;
        if object.id.is_temporary() {
            return Ok(());
        }
        let rel = self.resolver().relationship(&object.entity, relationship)?.clone();
        let value = if rel.is_to_one() {
            ArcValue::ToOne(members.into_iter().next())
        } else {
            ArcValue::ToMany(members)
        };
        self.attach_arc(source, relationship, value)
    }
}
