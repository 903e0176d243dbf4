//! Applying snapshot events posted by peer sessions

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::Result;
use crate::graph::{ObjectView, PersistenceState};
use crate::session::Session;
use crate::snapshot::SnapshotEvent;

impl Session {
    /// Apply every event waiting in the inbox; returns how many were applied
    ///
    /// Called at the start of every public operation, so callers only need
    /// it to pick up peer changes without touching the session otherwise.
    pub fn process_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.inbox.try_recv() {
            if event.posted_by.as_ref() == Some(&self.id) {
                continue;
            }
            if let Err(err) = self.apply_event(&event) {
                warn!(
                    component = module_path!(),
                    session_id = %self.id,
                    source = %event.source,
                    error = %err,
                    "failed to apply snapshot event"
                );
            }
            applied += 1;
        }
        applied
    }

    fn apply_event(&mut self, event: &SnapshotEvent) -> Result<()> {
        let delegate = Arc::clone(&self.runtime.delegate);

        for change in &event.modified {
            let Some(handle) = self.graph.lookup(&change.id) else {
                continue;
            };
            let object = self.graph.get(handle)?;
            let state = object.state();
            if !matches!(state, PersistenceState::Committed | PersistenceState::Modified) {
                continue;
            }
            if state == PersistenceState::Committed && self.mirrors_parent(&change.id) {
                continue;
            }
            if !delegate.should_merge_changes(&ObjectView::new(object), change) {
                continue;
            }
            if state == PersistenceState::Committed {
                self.apply_snapshot(handle, &change.after)?;
            } else {
                let before = change.before.as_ref().map(|s| &s.values);
                self.merge_snapshot(handle, before, &change.after)?;
            }
        }

        for id in &event.deleted {
            let Some(handle) = self.graph.lookup(id) else {
                continue;
            };
            let object = self.graph.get(handle)?;
            let state = object.state();
            if state == PersistenceState::New {
                continue;
            }
            if !delegate.should_process_delete(&ObjectView::new(object)) {
                continue;
            }
            if state == PersistenceState::Modified {
                // keep the edits; a commit would insert the row again
                let object = self.graph.get_mut(handle)?;
                object.state = PersistenceState::New;
                object.baseline.clear();
                object.upstream = None;
                object.snapshot_version = None;
                self.tracker.record_created(id);
            } else {
                self.graph.unregister(handle)?;
                self.tracker.clear(id);
            }
        }

        for id in &event.invalidated {
            let Some(handle) = self.graph.lookup(id) else {
                continue;
            };
            let object = self.graph.get_mut(handle)?;
            if object.state == PersistenceState::Committed {
                object.state = PersistenceState::Hollow;
                object.values.clear();
                object.arcs.clear();
                object.baseline.clear();
                object.upstream = None;
                object.snapshot_version = None;
            }
        }

        let resolver = self.resolver();
        for id in &event.indirectly_modified {
            let Some(handle) = self.graph.lookup(id) else {
                continue;
            };
            let object = self.graph.get(handle)?;
            if !matches!(
                object.state(),
                PersistenceState::Committed | PersistenceState::Modified
            ) {
                continue;
            }
            let diff = self.tracker.diff(id);
            let stale: Vec<String> = resolver
                .relationships(&object.entity)?
                .into_iter()
                .filter(|r| !r.is_to_one())
                .filter(|r| diff.map_or(true, |d| d.arc_ops(&r.name).next().is_none()))
                .map(|r| r.name.clone())
                .collect();
            let object = self.graph.get_mut(handle)?;
            for name in stale {
                object.arcs.shift_remove(&name);
            }
        }

        debug!(
            component = module_path!(),
            session_id = %self.id,
            source = %event.source,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            "applied peer snapshot event"
        );
        Ok(())
    }
}
