use std::sync::Arc;

use recall_core::cache::{CacheBackend, MemoryBackend};
use recall_core::config::EngineConfig;
use recall_core::store::{MemoryStore, ReviewStore};
use recall_core::SchedulerEngine;

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MemoryBackend>,
    pub engine: SchedulerEngine,
}

pub fn harness() -> TestHarness {
    harness_with_config(EngineConfig::default())
}

pub fn harness_with_config(config: EngineConfig) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let engine = SchedulerEngine::new(
        Arc::clone(&store) as Arc<dyn ReviewStore>,
        Arc::clone(&backend) as Arc<dyn CacheBackend>,
        config,
    );
    TestHarness {
        store,
        backend,
        engine,
    }
}
