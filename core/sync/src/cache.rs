//! Last confirmed read-model per domain, mirrored to durable storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use lifetrack_common::{Domain, Result};
use lifetrack_storage::{load_json, save_json, KeyValueStore};

/// Store key prefix for cached read-models.
pub const READ_MODEL_PREFIX: &str = "read_model";

/// The most recently confirmed payload for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReadModel {
    pub domain: Domain,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl CachedReadModel {
    pub fn new(domain: Domain, payload: Value) -> Self {
        Self {
            domain,
            payload,
            updated_at: Utc::now(),
        }
    }
}

fn store_key(domain: Domain) -> String {
    format!("{}/{}", READ_MODEL_PREFIX, domain.as_str())
}

/// In-memory read-models backed by a [`KeyValueStore`].
///
/// Models are handed out as `Arc`s; replacing a model swaps the `Arc`, so
/// readers holding the previous one keep a consistent snapshot.
pub struct ReadModelCache {
    store: Arc<dyn KeyValueStore>,
    models: RwLock<HashMap<Domain, Arc<CachedReadModel>>>,
}

impl ReadModelCache {
    /// Create an empty cache over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cache and load every persisted model.
    ///
    /// Unreadable entries are skipped with a warning rather than failing
    /// startup.
    pub async fn restore(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let cache = Self::new(store);
        let mut restored = 0;

        for domain in Domain::ALL {
            match load_json::<CachedReadModel, _>(cache.store.as_ref(), &store_key(domain)).await {
                Ok(Some(model)) => {
                    cache.insert(Arc::new(model));
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable cached model for {}: {}", domain, e),
            }
        }

        if restored > 0 {
            info!("Restored {} cached read-models", restored);
        }
        Ok(cache)
    }

    fn insert(&self, model: Arc<CachedReadModel>) {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.domain, model);
    }

    /// Get the cached model for `domain`.
    pub fn get(&self, domain: Domain) -> Option<Arc<CachedReadModel>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain)
            .cloned()
    }

    /// Replace the model for its domain and mirror it to storage.
    ///
    /// The in-memory model is replaced even if persisting fails.
    pub async fn replace(&self, model: CachedReadModel) -> Arc<CachedReadModel> {
        let model = Arc::new(model);
        self.insert(model.clone());

        match save_json(self.store.as_ref(), &store_key(model.domain), model.as_ref()).await {
            Ok(()) => debug!("Cached read-model for {}", model.domain),
            Err(e) => warn!("Failed to persist read-model for {}: {}", model.domain, e),
        }
        model
    }

    /// Drop the model for `domain` from memory and storage.
    pub async fn remove(&self, domain: Domain) -> Result<()> {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&domain);
        self.store.delete(&store_key(domain)).await
    }

    /// Domains that currently have a cached model.
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        domains.sort();
        domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifetrack_storage::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replace_is_visible_and_old_snapshot_survives() {
        let cache = ReadModelCache::new(Arc::new(MemoryStore::new()));
        assert!(cache.get(Domain::Finance).is_none());

        let first = cache
            .replace(CachedReadModel::new(Domain::Finance, json!({"balance": 10})))
            .await;
        let second = cache
            .replace(CachedReadModel::new(Domain::Finance, json!({"balance": 20})))
            .await;

        assert_eq!(first.payload["balance"], 10);
        assert_eq!(second.payload["balance"], 20);
        assert_eq!(cache.get(Domain::Finance).unwrap().payload["balance"], 20);
    }

    #[tokio::test]
    async fn test_models_survive_restart() {
        let temp = TempDir::new().unwrap();
        {
            let store = Arc::new(FileStore::new(temp.path()).unwrap());
            let cache = ReadModelCache::new(store);
            cache
                .replace(CachedReadModel::new(Domain::Dashboard, json!({"steps": 8000})))
                .await;
        }

        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        let cache = ReadModelCache::restore(store).await.unwrap();
        let model = cache.get(Domain::Dashboard).unwrap();

        assert_eq!(model.payload, json!({"steps": 8000}));
        assert_eq!(cache.domains(), vec![Domain::Dashboard]);
    }

    #[tokio::test]
    async fn test_restore_skips_corrupt_entries() {
        let store = MemoryStore::new();
        store
            .put("read_model/health", b"not json".to_vec())
            .await
            .unwrap();
        store
            .put(
                "read_model/calendar",
                serde_json::to_vec(&CachedReadModel::new(Domain::Calendar, json!([]))).unwrap(),
            )
            .await
            .unwrap();

        let cache = ReadModelCache::restore(Arc::new(store)).await.unwrap();
        assert!(cache.get(Domain::Health).is_none());
        assert!(cache.get(Domain::Calendar).is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        let cache = ReadModelCache::new(Arc::new(store.clone()));
        cache
            .replace(CachedReadModel::new(Domain::Habits, json!({})))
            .await;

        cache.remove(Domain::Habits).await.unwrap();
        assert!(cache.get(Domain::Habits).is_none());
        assert!(store.is_empty());
    }
}
