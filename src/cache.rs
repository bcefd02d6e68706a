//! Response cache policy over the durable `cache_entries` table: TTL on
//! read, LRU eviction by entry count and total body bytes on insert.

use crate::config::CacheConfig;
use crate::store::{CacheRow, CacheStats, SqliteStore, StoreError};
use crate::types::{now_millis, ResponseRecord, TokenUsage};

#[derive(Clone, Debug)]
pub struct CacheManager {
    store: SqliteStore,
    config: CacheConfig,
}

/// What a cache hit hands back to intake: enough to synthesize a completed
/// response without touching any backend.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub text: String,
    pub thinking: Option<String>,
    pub tokens: TokenUsage,
    pub provider_used: String,
}

impl CacheManager {
    pub fn new(store: SqliteStore, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<CachedResponse>, StoreError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let row = self.store.cache_get(fingerprint).await?;
        Ok(row.map(|row| CachedResponse {
            text: row.text,
            thinking: row.thinking,
            tokens: row.tokens,
            provider_used: row.provider_used,
        }))
    }

    /// Store a successful response under its fingerprint. `ttl_override`
    /// comes from the serving provider's descriptor when set.
    pub async fn put(
        &self,
        fingerprint: &str,
        response: &ResponseRecord,
        ttl_override: Option<u64>,
    ) -> Result<(), StoreError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = now_millis();
        let entry = CacheRow {
            fingerprint: fingerprint.to_string(),
            text: response.text.clone(),
            thinking: response.thinking.clone(),
            tokens: response.tokens,
            provider_used: response
                .provider_used
                .clone()
                .unwrap_or_default(),
            stored_at_ms: now,
            ttl_s: ttl_override.unwrap_or(self.config.default_ttl_s),
            last_used_ms: now,
        };
        self.store
            .cache_put(entry, self.config.max_entries, self.config.max_bytes)
            .await
    }

    pub async fn evict(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.store.cache_evict(fingerprint).await
    }

    pub async fn clear(&self) -> Result<u64, StoreError> {
        self.store.cache_clear().await
    }

    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        self.store.cache_cleanup().await
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        self.store.cache_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;

    fn response(text: &str) -> ResponseRecord {
        ResponseRecord {
            request_id: "r1".to_string(),
            text: text.to_string(),
            thinking: None,
            tokens: TokenUsage::new(2, 2),
            latency_ms: 5,
            backend: Some(BackendKind::HttpApi),
            provider_used: Some("stub".to_string()),
            error_kind: None,
            error_message: None,
            cached: false,
            completed_at_ms: now_millis(),
        }
    }

    async fn manager(config: CacheConfig) -> (tempfile::TempDir, CacheManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        (dir, CacheManager::new(store, config))
    }

    #[tokio::test]
    async fn round_trips_when_enabled() {
        let (_dir, cache) = manager(CacheConfig::default()).await;
        cache.put("fp", &response("hi"), None).await.expect("put");
        let hit = cache.get("fp").await.expect("get").expect("hit");
        assert_eq!(hit.text, "hi");
        assert_eq!(hit.provider_used, "stub");
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let (_dir, cache) = manager(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
        .await;
        cache.put("fp", &response("hi"), None).await.expect("put");
        assert!(cache.get("fp").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn per_provider_ttl_override_applies() {
        let (_dir, cache) = manager(CacheConfig {
            default_ttl_s: 300,
            ..CacheConfig::default()
        })
        .await;
        // A zero-second override means the entry is never stored.
        cache.put("fp", &response("hi"), Some(0)).await.expect("put");
        assert!(cache.get("fp").await.expect("get").is_none());
    }
}
