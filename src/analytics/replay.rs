//! Re-apply archived raw log files to the real-time counters

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::counters::RealtimeCounters;
use super::raw_log::{date_from_file_name, raw_log_path};
use crate::parser::{parse_log_file, ScanError};

/// Inclusive date filter; open ends are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub files: usize,
    pub records: usize,
    pub failed_files: Vec<PathBuf>,
}

/// Dates of every `<YYYY-MM-DD><suffix>` file in `dir`, ascending
pub fn discover_dates(dir: &Path, suffix: &str) -> Result<Vec<NaiveDate>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("read log directory {}", dir.display()))?;
    let mut dates = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(date) = entry.file_name().to_str().and_then(|name| date_from_file_name(name, suffix)) {
            dates.push(date);
        }
    }
    dates.sort_unstable();
    Ok(dates)
}

pub struct Replayer<'a> {
    counters: &'a RealtimeCounters,
    dir: PathBuf,
    suffix: String,
}

impl<'a> Replayer<'a> {
    pub fn new(counters: &'a RealtimeCounters, dir: impl Into<PathBuf>, suffix: &str) -> Self {
        Self {
            counters,
            dir: dir.into(),
            suffix: suffix.to_string(),
        }
    }

    /// Replay every file in range. A failing file is logged and skipped.
    pub async fn run(&self, range: DateRange, cancel: CancellationToken) -> Result<ReplayReport> {
        let dates = discover_dates(&self.dir, &self.suffix)?;
        let mut report = ReplayReport::default();

        for date in dates.into_iter().filter(|d| range.contains(*d)) {
            if cancel.is_cancelled() {
                break;
            }
            let path = raw_log_path(&self.dir, &self.suffix, date);
            match self.replay_file(&path, cancel.clone()).await {
                Ok(records) => {
                    info!(path = %path.display(), records, "replayed");
                    report.files += 1;
                    report.records += records;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "replay failed");
                    report.failed_files.push(path);
                }
            }
        }
        Ok(report)
    }

    async fn replay_file(&self, path: &Path, cancel: CancellationToken) -> Result<usize> {
        let records = match parse_log_file(path, cancel).await {
            Ok(records) => records,
            // Whatever was parsed before an interruption is still worth applying
            Err(partial) if matches!(partial.error, ScanError::Cancelled) => {
                let count = partial.records.len();
                for record in partial.records {
                    self.counters.record(&record.into_event()).await?;
                }
                anyhow::bail!("cancelled after {count} records");
            }
            Err(partial) => return Err(partial.into()),
        };

        let count = records.len();
        for record in records {
            self.counters.record(&record.into_event()).await?;
        }
        Ok(count)
    }
}
