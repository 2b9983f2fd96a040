//! Periodic snapshot of the real-time counters into the relational store
//!
//! Each run performs two independent folds:
//! - the rolling window over the last `lookback_days` calendar days
//! - all days still present in the cache (snapshot key 0), found with an
//!   incremental cursor scan
//!
//! A fold that fails is logged and abandoned; the next tick starts from scratch.

use anyhow::Result;
use chrono::{Days, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::counters::{date_from_visitor_key, RealtimeCounters, UV_KEY_PREFIX};
use super::diagnostics::Diagnostics;
use crate::db::Database;
use crate::kv::{with_timeout, ScanCursor};

/// Snapshot key for "all history still in the cache"
pub const ALL_TIME_WINDOW: u32 = 0;

const SCAN_BATCH: usize = 100;

/// Union of visitor sets and sum of region histograms over a set of days
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fold {
    pub days: usize,
    pub unique_visitors: u64,
    pub region_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct FoldBuilder {
    days: usize,
    visitors: HashSet<String>,
    regions: BTreeMap<String, i64>,
}

impl FoldBuilder {
    fn add_day(&mut self, visitors: HashSet<String>, regions: impl IntoIterator<Item = (String, i64)>) {
        self.days += 1;
        self.visitors.extend(visitors);
        for (region, count) in regions {
            *self.regions.entry(region).or_insert(0) += count;
        }
    }

    fn finish(self) -> Fold {
        Fold {
            days: self.days,
            unique_visitors: self.visitors.len() as u64,
            region_counts: self.regions,
        }
    }
}

/// Result of one ETL run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtlOutcome {
    pub window_saved: bool,
    pub all_time_saved: bool,
}

pub struct SnapshotWorker {
    counters: Arc<RealtimeCounters>,
    db: Database,
    lookback_days: u32,
    interval: Duration,
    op_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl SnapshotWorker {
    pub fn new(
        counters: Arc<RealtimeCounters>,
        db: Database,
        lookback_days: u32,
        interval: Duration,
        op_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            counters,
            db,
            lookback_days,
            interval,
            op_timeout,
            diagnostics,
        }
    }

    /// Fold the `lookback_days` days ending at `today`
    pub async fn fold_window(&self, today: NaiveDate) -> Result<Fold> {
        let mut fold = FoldBuilder::default();
        for offset in 0..self.lookback_days {
            let Some(date) = today.checked_sub_days(Days::new(u64::from(offset))) else {
                break;
            };
            let visitors = self.counters.day_visitors(date).await?;
            let regions = self.counters.day_regions(date).await?;
            fold.add_day(visitors, regions);
        }
        Ok(fold.finish())
    }

    /// Fold every day whose visitor set is still in the cache
    pub async fn fold_all(&self) -> Result<Fold> {
        let days = self.scan_days().await?;
        debug!(days = days.len(), "folding all cached days");

        let mut fold = FoldBuilder::default();
        for date in days {
            let visitors = self.counters.day_visitors(date).await?;
            let regions = self.counters.day_regions(date).await?;
            fold.add_day(visitors, regions);
        }
        Ok(fold.finish())
    }

    /// Walk the keyspace page by page; SCAN may repeat keys, so dates are deduplicated.
    async fn scan_days(&self) -> Result<BTreeSet<NaiveDate>> {
        let store = self.counters.store();
        let pattern = format!("{UV_KEY_PREFIX}*");
        let mut days = BTreeSet::new();
        let mut cursor = ScanCursor::START;
        loop {
            let page = with_timeout(self.op_timeout, store.scan(cursor, &pattern, SCAN_BATCH)).await?;
            days.extend(page.keys.iter().filter_map(|key| date_from_visitor_key(key)));
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(days)
    }

    async fn save(&self, lookback_days: u32, fold: &Fold) -> Result<()> {
        self.db
            .upsert_traffic_snapshot(lookback_days, fold.unique_visitors, &fold.region_counts, Utc::now())
            .await
    }

    /// Run both folds once. Each fold succeeds or fails on its own.
    pub async fn run_once(&self, today: NaiveDate) -> EtlOutcome {
        self.diagnostics.etl_run();

        let window_saved = match self.fold_window(today).await {
            Ok(fold) => match self.save(self.lookback_days, &fold).await {
                Ok(()) => {
                    debug!(window = self.lookback_days, visitors = fold.unique_visitors, "snapshot saved");
                    true
                }
                Err(e) => {
                    self.diagnostics.etl_fold_error();
                    warn!(window = self.lookback_days, error = %e, "save traffic snapshot failed");
                    false
                }
            },
            Err(e) => {
                self.diagnostics.etl_fold_error();
                warn!(window = self.lookback_days, error = %e, "rolling window fold failed");
                false
            }
        };

        let all_time_saved = match self.fold_all().await {
            Ok(fold) => match self.save(ALL_TIME_WINDOW, &fold).await {
                Ok(()) => {
                    debug!(days = fold.days, visitors = fold.unique_visitors, "all-time snapshot saved");
                    true
                }
                Err(e) => {
                    self.diagnostics.etl_fold_error();
                    warn!(error = %e, "save all-time traffic snapshot failed");
                    false
                }
            },
            Err(e) => {
                self.diagnostics.etl_fold_error();
                warn!(error = %e, "all-time fold failed");
                false
            }
        };

        EtlOutcome {
            window_saved,
            all_time_saved,
        }
    }

    /// Run forever on the configured interval, starting immediately
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                window = self.lookback_days,
                "Snapshot worker started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once(Utc::now().date_naive()).await;
            }
        })
    }
}
