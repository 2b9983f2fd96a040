use anyhow::{anyhow, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::aggregator::aggregate;
use super::cache::StatsCache;
use super::summary::{build_visit_summary, load_traffic_snapshot};
use super::types::StatsResult;
use crate::analytics::diagnostics::Diagnostics;
use crate::config::StatsConfig;
use crate::db::Database;
use crate::kv::SharedStore;

/// Serves the stats response from cache, recomputing on a miss
pub struct StatsService {
    db: Database,
    cache: StatsCache,
    window_days: u32,
    top_posts: u32,
    db_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl StatsService {
    pub fn new(config: &StatsConfig, db: Database, store: SharedStore, diagnostics: Arc<Diagnostics>) -> Self {
        let cache = StatsCache::new(
            store,
            config.cache_key.clone(),
            Duration::from_secs(config.cache_ttl_secs),
            Duration::from_millis(config.cache_timeout_ms),
            diagnostics.clone(),
        );
        Self {
            db,
            cache,
            window_days: config.window_days,
            top_posts: config.top_posts,
            db_timeout: Duration::from_millis(config.db_timeout_ms),
            diagnostics,
        }
    }

    pub async fn get_stats(&self) -> Result<StatsResult> {
        if let Some(cached) = self.cache.get().await {
            debug!(generated_at = %cached.generated_at, "stats served from cache");
            return Ok(cached);
        }
        self.refresh().await
    }

    /// Recompute and write through both cache tiers. A cache write failure is
    /// not an error for the caller.
    pub async fn refresh(&self) -> Result<StatsResult> {
        let result = self.compute().await?;
        let _ = self.cache.set(&result).await;
        Ok(result)
    }

    pub async fn compute(&self) -> Result<StatsResult> {
        self.diagnostics.stats_recompute();
        let today = Utc::now().date_naive();

        let snapshot = self
            .bounded("load traffic snapshot", load_traffic_snapshot(&self.db, self.window_days))
            .await?;
        let summary = self
            .bounded(
                "build visit summary",
                build_visit_summary(&self.db, self.window_days, self.top_posts, today),
            )
            .await?;

        let result = aggregate(&snapshot, summary, Utc::now());
        info!(
            total_visits = result.total_visits,
            unique_visitors = result.unique_visitors,
            regions = result.region_distribution.len(),
            "Stats recomputed"
        );
        Ok(result)
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.db_timeout, fut)
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.db_timeout))?
    }
}
