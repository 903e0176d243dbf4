//! Runtime: the collaborators and shared state every session is built from

use std::sync::Arc;

use snapgraph_core_types::SessionId;
use tracing::debug;

use super::Session;
use crate::collab::{RowSource, WriteSink};
use crate::config::CacheConfig;
use crate::diff::ChangeTracker;
use crate::errors::Result;
use crate::graph::IdentityMap;
use crate::model::EntityResolver;
use crate::policy::{DefaultDelegate, NoopValidationHook, SessionDelegate, ValidationHook};
use crate::snapshot::SnapshotStore;

/// Shared, immutable wiring of one mapping to its storage collaborators
///
/// A runtime owns the process-wide snapshot store when `shared_cache` is
/// enabled; otherwise every session gets a store of its own.
pub struct Runtime {
    pub(crate) resolver: Arc<EntityResolver>,
    pub(crate) source: Arc<dyn RowSource>,
    pub(crate) sink: Arc<dyn WriteSink>,
    pub(crate) hook: Arc<dyn ValidationHook>,
    pub(crate) delegate: Arc<dyn SessionDelegate>,
    pub(crate) config: CacheConfig,
    shared_store: Option<Arc<SnapshotStore>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("shared_store", &self.shared_store)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder(
        resolver: Arc<EntityResolver>,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn WriteSink>,
    ) -> RuntimeBuilder {
        RuntimeBuilder {
            resolver,
            source,
            sink,
            hook: None,
            delegate: None,
            config: CacheConfig::default(),
            store: None,
        }
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The shared snapshot store, `None` when sessions use local stores
    pub fn shared_store(&self) -> Option<&Arc<SnapshotStore>> {
        self.shared_store.as_ref()
    }

    /// Open a session subscribed to its snapshot store
    pub fn new_session(self: &Arc<Self>) -> Session {
        let id = SessionId::new();
        let store = match &self.shared_store {
            Some(store) => Arc::clone(store),
            None => Arc::new(SnapshotStore::from_config(
                format!("session-{}", id),
                &self.config,
            )),
        };
        let inbox = store.subscribe(&id);
        debug!(
            component = module_path!(),
            session_id = %id,
            store = store.name(),
            "session opened"
        );
        Session {
            id,
            runtime: Arc::clone(self),
            store,
            inbox,
            graph: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            parent_view: None,
        }
    }
}

pub struct RuntimeBuilder {
    resolver: Arc<EntityResolver>,
    source: Arc<dyn RowSource>,
    sink: Arc<dyn WriteSink>,
    hook: Option<Arc<dyn ValidationHook>>,
    delegate: Option<Arc<dyn SessionDelegate>>,
    config: CacheConfig,
    store: Option<Arc<SnapshotStore>>,
}

impl RuntimeBuilder {
    pub fn validation_hook(mut self, hook: Arc<dyn ValidationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn SessionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing store as the shared store, e.g. to share one cache
    /// between runtimes
    pub fn snapshot_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is out of range.
    pub fn build(self) -> Result<Arc<Runtime>> {
        self.config.validate()?;
        let shared_store = if self.config.shared_cache {
            Some(
                self.store
                    .unwrap_or_else(|| Arc::new(SnapshotStore::from_config("shared", &self.config))),
            )
        } else {
            None
        };
        Ok(Arc::new(Runtime {
            resolver: self.resolver,
            source: self.source,
            sink: self.sink,
            hook: self.hook.unwrap_or_else(|| Arc::new(NoopValidationHook)),
            delegate: self.delegate.unwrap_or_else(|| Arc::new(DefaultDelegate)),
            config: self.config,
            shared_store,
        }))
    }
}
