//! Injectable per-entity orchestrator cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::orchestrator::SyncOrchestrator;

#[derive(Default)]
pub struct OrchestratorCache {
    entries: Mutex<HashMap<Uuid, Arc<SyncOrchestrator>>>,
}

impl OrchestratorCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SyncOrchestrator>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, entity_id: Uuid) -> Option<Arc<SyncOrchestrator>> {
        self.lock().get(&entity_id).cloned()
    }

    pub fn get_or_insert_with<F>(&self, entity_id: Uuid, build: F) -> Arc<SyncOrchestrator>
    where
        F: FnOnce() -> SyncOrchestrator,
    {
        self.lock()
            .entry(entity_id)
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }

    pub fn clear(&self, entity_id: Uuid) -> bool {
        self.lock().remove(&entity_id).is_some()
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use taxmirror_adapters::{FixtureAutomation, PortalAdapter};
    use taxmirror_storage::{MemoryCredentialStore, MemoryDocumentStore, UpsertEngine};

    fn orchestrator() -> SyncOrchestrator {
        let automation = FixtureAutomation::from_json(r#"{"responses": []}"#, ".").expect("fixture");
        SyncOrchestrator::new(
            PortalAdapter::new(Arc::new(automation), Arc::new(MemoryCredentialStore::new())),
            UpsertEngine::new(Arc::new(MemoryDocumentStore::new())),
        )
    }

    #[test]
    fn builds_once_per_entity_and_clears() {
        let cache = OrchestratorCache::new();
        let builds = AtomicUsize::new(0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            orchestrator()
        };

        let first = cache.get_or_insert_with(a, build);
        let again = cache.get_or_insert_with(a, build);
        assert!(Arc::ptr_eq(&first, &again));
        cache.get_or_insert_with(b, build);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);

        assert!(cache.clear(a));
        assert!(!cache.clear(a));
        assert!(cache.get(a).is_none());
        assert!(cache.get(b).is_some());

        cache.clear_all();
        assert!(cache.is_empty());
    }
}
