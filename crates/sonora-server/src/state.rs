//! Shared application state

use std::sync::Arc;

use sonora_core::{ModelRegistry, ServerConfig};

use crate::cache::ResultCache;
use crate::db::TaskStore;
use crate::worker::TaskWorker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// SQLite-backed task store.
    pub store: TaskStore,
    pub registry: ModelRegistry,
    pub cache: ResultCache,
    pub worker: TaskWorker,
}

impl AppState {
    pub fn new(config: ServerConfig, store: TaskStore, registry: ModelRegistry) -> Self {
        let cache = ResultCache::new(
            config.cache.dir.clone(),
            config.cache.ttl_secs,
            config.cache.frequency_secs,
        );
        let worker = TaskWorker::new(
            store.clone(),
            registry.clone(),
            cache.clone(),
            config.server.max_concurrent_tasks,
        );

        Self {
            config: Arc::new(config),
            store,
            registry,
            cache,
            worker,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.config.server.max_upload_bytes()
    }
}
