//! Maps URL prefix to worker. Longest-prefix lookup with an optional "/"
//! fallback, concurrency-safe via a single readers-writer lock.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::worker::WorkerHandle;

pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<String, WorkerHandle>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn register(&self, handle: WorkerHandle) {
        let mut workers = self.workers.write().await;
        workers.insert(handle.url_prefix.clone(), handle);
    }

    pub async fn unregister(&self, url_prefix: &str) {
        let mut workers = self.workers.write().await;
        workers.remove(url_prefix);
    }

    /// Longest-prefix match; prefixes compared as strings (no trailing
    /// slash normalization). Falls back to a worker registered at "/" if
    /// one exists and nothing else matched.
    pub async fn lookup(&self, path: &str) -> Option<WorkerHandle> {
        let workers = self.workers.read().await;
        let mut best: Option<&WorkerHandle> = None;
        for handle in workers.values() {
            if path.starts_with(handle.url_prefix.as_str()) {
                let is_longer = best
                    .map(|b| handle.url_prefix.len() > b.url_prefix.len())
                    .unwrap_or(true);
                if is_longer {
                    best = Some(handle);
                }
            }
        }
        best.cloned()
            .or_else(|| workers.get("/").cloned())
    }

    pub async fn all(&self) -> Vec<WorkerHandle> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Looked up by worker name rather than URL prefix — used by the file
    /// watcher, which learns a worker's identity from its directory name.
    pub async fn find_by_name(&self, name: &str) -> Option<WorkerHandle> {
        self.workers
            .read()
            .await
            .values()
            .find(|h| h.name == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::fake_handle;

    #[tokio::test]
    async fn longest_prefix_wins() {
        let registry = WorkerRegistry::new();
        registry.register(fake_handle("api", "/api")).await;
        registry.register(fake_handle("api-v1", "/api/v1")).await;

        let hit = registry.lookup("/api/v1/users").await.unwrap();
        assert_eq!(hit.name, "api-v1");
    }

    #[tokio::test]
    async fn fallback_to_root_when_nothing_matches() {
        let registry = WorkerRegistry::new();
        registry.register(fake_handle("api", "/api")).await;
        registry.register(fake_handle("index", "/")).await;

        let hit = registry.lookup("/unrelated").await.unwrap();
        assert_eq!(hit.name, "index");
    }

    #[tokio::test]
    async fn no_match_and_no_fallback_is_none() {
        let registry = WorkerRegistry::new();
        registry.register(fake_handle("api", "/api")).await;

        assert!(registry.lookup("/unknown").await.is_none());
    }

    #[tokio::test]
    async fn find_by_name_is_independent_of_prefix() {
        let registry = WorkerRegistry::new();
        registry.register(fake_handle("api", "/api")).await;

        let hit = registry.find_by_name("api").await.unwrap();
        assert_eq!(hit.url_prefix, "/api");
        assert!(registry.find_by_name("missing").await.is_none());
    }
}
