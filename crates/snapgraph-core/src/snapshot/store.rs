//! Shared snapshot store
//!
//! A sharded map from identity to the last observed row. Entries are
//! versioned by the store, bounded by an LRU capacity and optionally expire
//! by age. Mutations that replace known data are broadcast to subscribed
//! sessions over unbounded channels, so posting never waits for readers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use snapgraph_core_types::SessionId;
use tracing::debug;

use super::{Snapshot, SnapshotChange, SnapshotEvent};
use crate::config::CacheConfig;
use crate::model::{ObjectId, Row};

struct StoreEntry {
    snapshot: Arc<Snapshot>,
    stored_at: Instant,
    last_access: AtomicU64,
    groups: HashSet<String>,
}

impl StoreEntry {
    fn new(snapshot: Arc<Snapshot>, tick: u64, group: Option<&str>) -> Self {
        Self {
            snapshot,
            stored_at: Instant::now(),
            last_access: AtomicU64::new(tick),
            groups: group.map(|g| g.to_string()).into_iter().collect(),
        }
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }
}

struct Subscriber {
    session: SessionId,
    sender: Sender<Arc<SnapshotEvent>>,
}

/// One row change reported by a committing session
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotUpdate {
    pub id: ObjectId,
    pub values: Row,
    /// Version the committing session based its write on; a mismatch with
    /// the cached version evicts the entry instead of overwriting it
    pub replaces_version: Option<u64>,
}

/// Everything one commit changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotChanges {
    pub updated: Vec<SnapshotUpdate>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
    pub indirectly_modified: Vec<ObjectId>,
}

enum Installed {
    Unchanged(Arc<Snapshot>),
    Created(Arc<Snapshot>),
    Replaced {
        before: Option<Arc<Snapshot>>,
        after: Arc<Snapshot>,
    },
}

pub struct SnapshotStore {
    name: String,
    entries: DashMap<ObjectId, StoreEntry>,
    capacity: usize,
    expiration: Option<Duration>,
    next_version: AtomicU64,
    clock: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SnapshotStore {
    pub fn new(name: impl Into<String>, capacity: usize, expiration: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            capacity: capacity.max(1),
            expiration,
            next_version: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(name, config.snapshot_cache_size, config.expiration())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &StoreEntry) -> bool {
        self.expiration
            .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl)
    }

    /// Cached snapshot, or `None` when absent or expired; never fetches
    pub fn get(&self, id: &ObjectId) -> Option<Arc<Snapshot>> {
        match self.entries.get(id) {
            None => return None,
            Some(entry) if !self.is_expired(&entry) => {
                entry.touch(self.tick());
                return Some(entry.snapshot.clone());
            }
            Some(_) => {}
        }
        // a put may have replaced the entry since the read guard dropped
        self.entries.remove_if(id, |_, entry| self.is_expired(entry));
        None
    }

    pub fn version_of(&self, id: &ObjectId) -> Option<u64> {
        self.get(id).map(|s| s.version)
    }

    /// Insert or replace one snapshot (last writer wins)
    pub fn put(&self, id: ObjectId, values: Row) -> Arc<Snapshot> {
        let mut modified = Vec::new();
        let installed = self.install(id.clone(), values, None);
        let snapshot = Self::collect_change(id, installed, &mut modified);
        self.evict_overflow();
        self.publish_modified(None, modified);
        snapshot
    }

    fn collect_change(
        id: ObjectId,
        installed: Installed,
        modified: &mut Vec<SnapshotChange>,
    ) -> Arc<Snapshot> {
        match installed {
            Installed::Unchanged(snapshot) | Installed::Created(snapshot) => snapshot,
            Installed::Replaced { before, after } => {
                if before.is_some() {
                    modified.push(SnapshotChange {
                        id,
                        before,
                        after: after.clone(),
                    });
                }
                after
            }
        }
    }

    fn publish_modified(&self, posted_by: Option<&SessionId>, modified: Vec<SnapshotChange>) {
        if modified.is_empty() {
            return;
        }
        self.publish(SnapshotEvent {
            source: self.name.clone(),
            posted_by: posted_by.cloned(),
            modified,
            ..SnapshotEvent::default()
        });
    }

    /// Insert or replace fetched rows (last writer wins per identity)
    ///
    /// Rows equal to the cached snapshot keep its version. Replacements of
    /// different data are broadcast in one event, skipping `posted_by`.
    /// Entries are tagged with `group` when given.
    pub fn put_rows(
        &self,
        posted_by: Option<&SessionId>,
        group: Option<&str>,
        rows: Vec<(ObjectId, Row)>,
    ) -> Vec<Arc<Snapshot>> {
        let mut stored = Vec::with_capacity(rows.len());
        let mut modified = Vec::new();
        for (id, values) in rows {
            let installed = self.install(id.clone(), values, group);
            stored.push(Self::collect_change(id, installed, &mut modified));
        }
        self.evict_overflow();
        self.publish_modified(posted_by, modified);
        stored
    }

    fn install(&self, id: ObjectId, values: Row, group: Option<&str>) -> Installed {
        let tick = self.tick();
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                let expired = self.is_expired(occupied.get());
                if !expired && occupied.get().snapshot.values == values {
                    let entry = occupied.get_mut();
                    entry.touch(tick);
                    if let Some(g) = group {
                        entry.groups.insert(g.to_string());
                    }
                    return Installed::Unchanged(entry.snapshot.clone());
                }
                let before = occupied.get().snapshot.clone();
                let after = Arc::new(Snapshot {
                    values,
                    version: self.version(),
                    replaces_version: Some(before.version),
                });
                let mut entry = StoreEntry::new(after.clone(), tick, group);
                if !expired {
                    entry.groups.extend(occupied.get().groups.iter().cloned());
                }
                occupied.insert(entry);
                Installed::Replaced {
                    before: (!expired).then_some(before),
                    after,
                }
            }
            Entry::Vacant(vacant) => {
                let snapshot = Arc::new(Snapshot {
                    values,
                    version: self.version(),
                    replaces_version: None,
                });
                vacant.insert(StoreEntry::new(snapshot.clone(), tick, group));
                Installed::Created(snapshot)
            }
        }
    }

    /// Evict one entry without notifying anyone
    pub fn forget(&self, id: &ObjectId) -> Option<Arc<Snapshot>> {
        self.entries.remove(id).map(|(_, entry)| entry.snapshot)
    }

    /// Evict every entry, or only those tagged with `group`
    pub fn invalidate_all(&self, group: Option<&str>) -> usize {
        let before = self.entries.len();
        match group {
            None => self.entries.clear(),
            Some(g) => self.entries.retain(|_, entry| !entry.groups.contains(g)),
        }
        let removed = before.saturating_sub(self.entries.len());
        debug!(
            component = module_path!(),
            store = %self.name,
            group = group.unwrap_or("*"),
            removed,
            "snapshot group invalidated"
        );
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Apply the outcome of one commit and broadcast it
    ///
    /// Returns the snapshots installed for `changes.updated`; identities
    /// whose expected version did not match are evicted instead and reported
    /// to peers as invalidated.
    pub fn process_changes(
        &self,
        posted_by: Option<&SessionId>,
        changes: SnapshotChanges,
    ) -> HashMap<ObjectId, Arc<Snapshot>> {
        let mut installed = HashMap::new();
        let mut event = SnapshotEvent {
            source: self.name.clone(),
            posted_by: posted_by.cloned(),
            ..SnapshotEvent::default()
        };

        for update in changes.updated {
            let tick = self.tick();
            match self.entries.entry(update.id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let current = occupied.get().snapshot.clone();
                    let race = update
                        .replaces_version
                        .is_some_and(|expected| expected != current.version);
                    if race {
                        // unknowable ordering against another writer
                        occupied.remove();
                        event.invalidated.push(update.id);
                        continue;
                    }
                    let after = Arc::new(Snapshot {
                        values: update.values,
                        version: self.version(),
                        replaces_version: Some(current.version),
                    });
                    occupied.insert(StoreEntry::new(after.clone(), tick, None));
                    installed.insert(update.id.clone(), after.clone());
                    event.modified.push(SnapshotChange {
                        id: update.id,
                        before: Some(current),
                        after,
                    });
                }
                Entry::Vacant(vacant) => {
                    let after = Arc::new(Snapshot {
                        values: update.values,
                        version: self.version(),
                        replaces_version: update.replaces_version,
                    });
                    vacant.insert(StoreEntry::new(after.clone(), tick, None));
                    installed.insert(update.id.clone(), after.clone());
                    event.modified.push(SnapshotChange {
                        id: update.id,
                        before: None,
                        after,
                    });
                }
            }
        }

        for id in changes.deleted {
            self.entries.remove(&id);
            event.deleted.push(id);
        }
        for id in changes.invalidated {
            self.entries.remove(&id);
            event.invalidated.push(id);
        }
        event.indirectly_modified = changes.indirectly_modified;

        self.evict_overflow();
        if !event.is_empty() {
            self.publish(event);
        }
        installed
    }

    /// Register a session for events; events it posts itself are not sent
    pub fn subscribe(&self, session: &SessionId) -> Receiver<Arc<SnapshotEvent>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| &s.session != session);
        subscribers.push(Subscriber {
            session: session.clone(),
            sender,
        });
        receiver
    }

    pub fn unsubscribe(&self, session: &SessionId) {
        self.subscribers.write().retain(|s| &s.session != session);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn publish(&self, event: SnapshotEvent) {
        let event = Arc::new(event);
        let mut dead = Vec::new();
        let mut delivered = 0usize;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if event.posted_by.as_ref() == Some(&subscriber.session) {
                    continue;
                }
                match subscriber.sender.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(subscriber.session.clone()),
                }
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .write()
                .retain(|s| !dead.contains(&s.session));
        }
        debug!(
            component = module_path!(),
            store = %self.name,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            indirectly_modified = event.indirectly_modified.len(),
            delivered,
            "snapshot event posted"
        );
    }

    fn evict_overflow(&self) {
        let len = self.entries.len();
        if len <= self.capacity {
            return;
        }
        let excess = len - self.capacity;
        let mut candidates: Vec<(u64, ObjectId)> = self
            .entries
            .iter()
            .map(|e| (e.value().last_access.load(Ordering::Relaxed), e.key().clone()))
            .collect();
        candidates.sort_by_key(|(tick, _)| *tick);
        for (_, id) in candidates.into_iter().take(excess) {
            self.entries.remove(&id);
        }
        debug!(
            component = module_path!(),
            store = %self.name,
            evicted = excess,
            "snapshot cache over capacity"
        );
    }
}
