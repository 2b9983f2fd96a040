//! Request analytics pipeline
//!
//! Capture queue -> raw log + real-time counters -> periodic snapshot into the
//! relational store. [`Analytics`] owns the process-wide pieces and starts each
//! background task at most once.

pub mod capture;
pub mod counters;
pub mod diagnostics;
pub mod etl;
pub mod raw_log;
pub mod replay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::warn;

use self::capture::{CaptureSinks, EventCapture};
use self::counters::RealtimeCounters;
use self::diagnostics::Diagnostics;
use self::etl::SnapshotWorker;
use self::raw_log::DailyLogWriter;
use crate::config::AnalyticsConfig;
use crate::db::Database;
use crate::geoip::SharedResolver;
use crate::kv::SharedStore;

pub struct Analytics {
    config: AnalyticsConfig,
    counters: Arc<RealtimeCounters>,
    db: Database,
    diagnostics: Arc<Diagnostics>,
    capture: OnceLock<EventCapture>,
    etl_started: AtomicBool,
}

impl Analytics {
    pub fn new(
        config: AnalyticsConfig,
        store: SharedStore,
        resolver: SharedResolver,
        db: Database,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let counters = RealtimeCounters::new(
            store,
            resolver,
            config.key_ttl(),
            Duration::from_millis(config.capture_timeout_ms),
        );
        Self {
            config,
            counters: Arc::new(counters),
            db,
            diagnostics,
            capture: OnceLock::new(),
            etl_started: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Producer handle for the capture queue. The first call creates the queue
    /// and spawns its consumer, so it must run inside a Tokio runtime.
    pub fn capture(&self) -> EventCapture {
        self.capture
            .get_or_init(|| {
                let raw_log = match DailyLogWriter::new(&self.config.log_dir, &self.config.raw_log_suffix) {
                    Ok(writer) => Some(Arc::new(writer)),
                    Err(e) => {
                        warn!(
                            dir = %self.config.log_dir.display(),
                            error = %e,
                            "raw log disabled: cannot create log directory"
                        );
                        None
                    }
                };
                let (capture, queue) = capture::channel(self.config.queue_capacity, self.diagnostics.clone());
                capture::spawn_consumer(
                    queue,
                    CaptureSinks {
                        raw_log,
                        counters: self.counters.clone(),
                        diagnostics: self.diagnostics.clone(),
                    },
                );
                capture
            })
            .clone()
    }

    /// Start the snapshot worker. Returns false if it was already running.
    pub fn start_etl(&self) -> bool {
        if self
            .etl_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let worker = SnapshotWorker::new(
            self.counters.clone(),
            self.db.clone(),
            self.config.lookback_days,
            self.config.etl_interval(),
            Duration::from_millis(self.config.etl_timeout_ms),
            self.diagnostics.clone(),
        );
        Arc::new(worker).spawn();
        true
    }
}
