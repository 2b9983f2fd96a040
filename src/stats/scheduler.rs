//! Daily stats refresh at a fixed local hour

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::service::StatsService;

const REFRESH_BUDGET: Duration = Duration::from_secs(120);

/// First `hour:00` strictly after `now`, in `now`'s time zone
pub fn next_refresh_after<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let tz = now.timezone();
    let mut day = now.date_naive();
    // Two attempts cover "later today" and "tomorrow"; a third covers a DST gap
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        day = day.succ_opt().unwrap_or(day);
    }
    now.clone() + ChronoDuration::days(1)
}

pub struct RefreshScheduler {
    service: Arc<StatsService>,
    hour: u32,
    started: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(service: Arc<StatsService>, hour: u32) -> Self {
        Self {
            service,
            hour,
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the daily loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(hour = scheduler.hour, "Stats refresh scheduler started");
            loop {
                let now = Local::now();
                let next = next_refresh_after(&now, scheduler.hour);
                let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                match tokio::time::timeout(REFRESH_BUDGET, scheduler.service.refresh()).await {
                    Ok(Ok(result)) => info!(
                        total_visits = result.total_visits,
                        unique_visitors = result.unique_visitors,
                        "Daily stats refresh complete"
                    ),
                    Ok(Err(e)) => warn!(error = %e, "daily stats refresh failed"),
                    Err(_) => warn!(budget_secs = REFRESH_BUDGET.as_secs(), "daily stats refresh timed out"),
                }
            }
        });
        true
    }
}
