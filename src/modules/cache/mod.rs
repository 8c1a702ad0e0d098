//! Decision cache keyed by normalized host.
//!
//! Records are stored as JSON under `strategy:v2:{host}`. A hit hands back the
//! stored record unchanged; failures on either side degrade to a miss.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::decision::Decision;
use crate::modules::store::{StoreError, StrategyStore};

pub const CACHE_KEY_PREFIX: &str = "strategy:v2:";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Failure reading or writing a cached decision.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cached decision for `{key}` is malformed: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decision could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn cache_key(target_key: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{target_key}")
}

/// Store-backed decision cache.
#[derive(Clone)]
pub struct StrategyCache {
    store: Arc<dyn StrategyStore>,
    ttl: Duration,
}

impl StrategyCache {
    pub fn new(store: Arc<dyn StrategyStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached decision, failing loudly on store or decode errors.
    pub async fn lookup(&self, target_key: &str) -> Result<Option<Decision>, DecisionError> {
        let key = cache_key(target_key);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| DecisionError::Malformed { key, source })
    }

    /// Cached decision; any failure reads as a miss.
    pub async fn get(&self, target_key: &str) -> Option<Decision> {
        match self.lookup(target_key).await {
            Ok(hit) => hit,
            Err(err) => {
                log::warn!("strategy cache read degraded to miss: {err}");
                None
            }
        }
    }

    /// Write a decision under its own target key with the cache TTL.
    pub async fn store(&self, decision: &Decision) -> Result<(), DecisionError> {
        self.put(decision, self.ttl).await
    }

    pub async fn put(&self, decision: &Decision, ttl: Duration) -> Result<(), DecisionError> {
        let payload = serde_json::to_vec(decision).map_err(DecisionError::Encode)?;
        self.store
            .set(&cache_key(decision.target_key()), &payload, ttl)
            .await?;
        log::info!(
            "cached {} decision for {} ({:.2})",
            decision.method(),
            decision.target_key(),
            decision.confidence()
        );
        Ok(())
    }

    /// Drop the cached decision, returning whether one was live.
    pub async fn invalidate(&self, target_key: &str) -> Result<bool, DecisionError> {
        Ok(self.store.delete(&cache_key(target_key)).await?)
    }
}

impl std::fmt::Debug for StrategyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyCache")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionSource, Method};
    use crate::modules::store::MemoryStore;

    fn decision() -> Decision {
        Decision::new("example.com", Method::Rendered, 0.8, DecisionSource::Rule)
            .unwrap()
            .with_bypass_strategies(["enable_javascript"])
    }

    #[tokio::test]
    async fn hit_returns_stored_record() {
        let store = Arc::new(MemoryStore::new());
        let cache = StrategyCache::new(store.clone());
        let original = decision();
        cache.store(&original).await.unwrap();

        let raw = store.get("strategy:v2:example.com").await.unwrap().unwrap();
        assert_eq!(raw, serde_json::to_vec(&original).unwrap());
        assert_eq!(cache.get("example.com").await, Some(original));
    }

    #[tokio::test]
    async fn malformed_record_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("strategy:v2:example.com", br#"{"method":"teleport"}"#, DEFAULT_CACHE_TTL)
            .await
            .unwrap();
        let cache = StrategyCache::new(store);
        assert!(matches!(
            cache.lookup("example.com").await,
            Err(DecisionError::Malformed { .. })
        ));
        assert_eq!(cache.get("example.com").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = StrategyCache::new(Arc::new(MemoryStore::new()));
        cache.store(&decision()).await.unwrap();
        assert!(cache.invalidate("example.com").await.unwrap());
        assert_eq!(cache.get("example.com").await, None);
        assert!(!cache.invalidate("example.com").await.unwrap());
    }
}
