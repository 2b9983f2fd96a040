//! Two-tier stats cache
//!
//! Tier 1 is the shared key-value store. Tier 2 is an in-process copy of the
//! last value this process wrote or read from tier 1, used whenever tier 1
//! misses or fails.

use cached::{Cached, TimedCache};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::StatsResult;
use crate::analytics::diagnostics::Diagnostics;
use crate::kv::{with_timeout, SharedStore, StoreError};

pub struct StatsCache {
    store: SharedStore,
    key: String,
    ttl: Duration,
    op_timeout: Duration,
    local: Mutex<TimedCache<(), StatsResult>>,
    diagnostics: Arc<Diagnostics>,
}

impl StatsCache {
    pub fn new(
        store: SharedStore,
        key: impl Into<String>,
        ttl: Duration,
        op_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            op_timeout,
            // Lifespan is counted in whole seconds
            local: Mutex::new(TimedCache::with_lifespan(ttl.as_secs().max(1))),
            diagnostics,
        }
    }

    /// Tier 1, then tier 2. `None` means the caller has to recompute.
    pub async fn get(&self) -> Option<StatsResult> {
        match with_timeout(self.op_timeout, self.store.get(&self.key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<StatsResult>(&bytes) {
                Ok(result) => {
                    self.store_local(&result);
                    return Some(result);
                }
                Err(e) => {
                    self.diagnostics.stats_cache_error();
                    warn!(key = %self.key, error = %e, "cached stats undecodable");
                }
            },
            Ok(None) => debug!(key = %self.key, "stats cache miss"),
            Err(e) => {
                self.diagnostics.stats_cache_error();
                warn!(key = %self.key, error = %e, "stats cache read failed");
            }
        }
        self.local_value()
    }

    /// Write both tiers. Tier 2 is updated even when tier 1 fails; the tier 1
    /// error is still returned.
    pub async fn set(&self, result: &StatsResult) -> Result<(), StoreError> {
        let stored = match serde_json::to_vec(result) {
            Ok(payload) => with_timeout(self.op_timeout, self.store.set_ex(&self.key, &payload, self.ttl)).await,
            Err(e) => Err(StoreError::Unavailable(format!("encode stats: {e}"))),
        };

        self.store_local(result);

        if let Err(e) = &stored {
            self.diagnostics.stats_cache_error();
            warn!(key = %self.key, error = %e, "stats cache write failed, kept in-process copy");
        }
        stored
    }

    fn store_local(&self, result: &StatsResult) {
        if let Ok(mut local) = self.local.lock() {
            local.cache_set((), result.clone());
        }
    }

    fn local_value(&self) -> Option<StatsResult> {
        let mut local = self.local.lock().ok()?;
        local.cache_get(&()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryStore};
    use crate::stats::types::{RegionStat, TopPost};
    use chrono::{TimeZone, Utc};

    fn sample() -> StatsResult {
        StatsResult {
            total_visits: 120,
            unique_visitors: 37,
            top_posts: vec![TopPost {
                post_id: 3,
                title: "Rust 笔记".into(),
                path: "/posts/3".into(),
                count: 60,
            }],
            region_distribution: vec![
                RegionStat { name: "北京".into(), percentage: 66.67 },
                RegionStat { name: "上海".into(), percentage: 33.33 },
            ],
            generated_at: Utc.with_ymd_and_hms(2024, 4, 5, 6, 7, 8).unwrap() + chrono::Duration::nanoseconds(123_456_789),
        }
    }

    fn cache(store: Arc<MemoryStore>, ttl: Duration) -> (StatsCache, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let cache = StatsCache::new(store, "stats:summary", ttl, Duration::from_millis(200), diagnostics.clone());
        (cache, diagnostics)
    }

    #[tokio::test]
    async fn read_after_write_is_byte_identical() {
        let store = Arc::new(MemoryStore::new());
        let (cache, _) = cache(store.clone(), Duration::from_secs(60));
        let written = sample();
        cache.set(&written).await.unwrap();

        let read = cache.get().await.unwrap();
        assert_eq!(serde_json::to_vec(&read).unwrap(), serde_json::to_vec(&written).unwrap());
        assert_eq!(store.get("stats:summary").await.unwrap(), Some(serde_json::to_vec(&written).unwrap()));
        assert!(store.ttl("stats:summary").is_some());
    }

    #[tokio::test]
    async fn falls_back_to_in_process_copy_during_outage() {
        let store = Arc::new(MemoryStore::new());
        let (cache, diagnostics) = cache(store.clone(), Duration::from_secs(60));
        cache.set(&sample()).await.unwrap();

        store.set_available(false);
        assert_eq!(cache.get().await, Some(sample()));
        assert_eq!(diagnostics.snapshot().stats_cache_errors, 1);
    }

    #[tokio::test]
    async fn failed_tier_one_write_still_updates_tier_two() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let (cache, _) = cache(store.clone(), Duration::from_secs(60));

        assert!(cache.set(&sample()).await.is_err());
        assert_eq!(cache.get().await, Some(sample()));

        // Tier 1 back but empty: still served from tier 2
        store.set_available(true);
        assert_eq!(cache.get().await, Some(sample()));
    }

    #[tokio::test]
    async fn tier_one_hit_refreshes_the_in_process_copy() {
        let store = Arc::new(MemoryStore::new());
        let (writer, _) = cache(store.clone(), Duration::from_secs(60));
        let (reader, diagnostics) = cache(store.clone(), Duration::from_secs(60));
        writer.set(&sample()).await.unwrap();

        assert_eq!(reader.get().await, Some(sample()));
        store.set_available(false);
        assert_eq!(reader.get().await, Some(sample()));
        assert_eq!(diagnostics.snapshot().stats_cache_errors, 1);
    }

    #[tokio::test]
    async fn nothing_cached_means_recompute() {
        let (cache, _) = cache(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn in_process_copy_expires() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let (cache, _) = cache(store, Duration::from_secs(1));
        let _ = cache.set(&sample()).await;
        assert_eq!(cache.get().await, Some(sample()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn undecodable_tier_one_value_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set_ex("stats:summary", b"{oops", Duration::from_secs(60)).await.unwrap();
        let (cache, diagnostics) = cache(store, Duration::from_secs(60));

        assert_eq!(cache.get().await, None);
        assert_eq!(diagnostics.snapshot().stats_cache_errors, 1);
    }
}
