//! Append-only, date-partitioned raw request log
//!
//! One pipe-delimited line per event:
//! `timestamp|ip|method|path|status|latency_us|user_agent`, written to
//! `<dir>/<YYYY-MM-DD><suffix>` for the event's UTC date.

use chrono::{NaiveDate, SecondsFormat};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::events::RequestEvent;

struct WriterState {
    date: Option<NaiveDate>,
    file: Option<File>,
}

/// Raw log writer that rolls over to a new file at each date boundary
pub struct DailyLogWriter {
    dir: PathBuf,
    suffix: String,
    state: Mutex<WriterState>,
}

impl DailyLogWriter {
    /// Create the writer, creating the log directory if needed
    pub fn new(dir: impl Into<PathBuf>, suffix: &str) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            suffix: suffix.to_string(),
            state: Mutex::new(WriterState { date: None, file: None }),
        })
    }

    /// Append one event to the file for its date
    pub fn append(&self, event: &RequestEvent) -> io::Result<()> {
        let line = encode_line(event);
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "raw log writer lock poisoned"))?;

        let date = event.day();
        if state.date != Some(date) || state.file.is_none() {
            // Drop the old handle before opening the next day's file
            state.file = None;
            let path = raw_log_path(&self.dir, &self.suffix, date);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            state.file = Some(file);
            state.date = Some(date);
        }

        match state.file.as_mut() {
            Some(file) => file.write_all(line.as_bytes()),
            None => Err(io::Error::new(io::ErrorKind::Other, "raw log file not open")),
        }
    }

    /// Path of the file currently open, if any
    #[cfg(test)]
    pub(crate) fn current_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().ok()?;
        state.date.map(|date| raw_log_path(&self.dir, &self.suffix, date))
    }
}

pub fn raw_log_path(dir: &Path, suffix: &str, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}{}", date.format("%Y-%m-%d"), suffix))
}

/// Date encoded in a raw log file name, if it matches `<YYYY-MM-DD><suffix>`
pub fn date_from_file_name(name: &str, suffix: &str) -> Option<NaiveDate> {
    let date = name.strip_suffix(suffix)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Serialize an event to one raw log line, newline included
pub fn encode_line(event: &RequestEvent) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}\n",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        clean(&event.ip).replace('|', ""),
        clean(&event.method).replace('|', ""),
        clean(&event.path).replace('|', "%7C"),
        event.status,
        event.latency.as_micros(),
        clean(&event.user_agent),
    )
}

fn clean(field: &str) -> String {
    field.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn event_at(day: u32, path: &str) -> RequestEvent {
        RequestEvent::new("1.2.3.4".into(), "GET".into(), path.into(), 200)
            .with_timestamp(Utc.with_ymd_and_hms(2024, 5, day, 23, 59, 59).unwrap())
            .with_latency(Duration::from_micros(1234))
            .with_user_agent("curl/8.0".into())
    }

    #[test]
    fn line_layout() {
        let line = encode_line(&event_at(1, "/api/posts/7"));
        assert_eq!(
            line,
            "2024-05-01T23:59:59.000000000Z|1.2.3.4|GET|/api/posts/7|200|1234|curl/8.0\n"
        );
    }

    #[test]
    fn line_never_spans_two_records() {
        let mut event = event_at(1, "/a|b");
        event.user_agent = "evil\nagent".into();
        let line = encode_line(&event);
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("|/a%7Cb|"));
    }

    #[test]
    fn rolls_over_at_date_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DailyLogWriter::new(dir.path().join("logs"), "_raw.log").unwrap();

        writer.append(&event_at(1, "/one")).unwrap();
        writer.append(&event_at(1, "/two")).unwrap();
        assert_eq!(writer.current_path(), Some(dir.path().join("logs/2024-05-01_raw.log")));

        writer.append(&event_at(2, "/three")).unwrap();
        assert_eq!(writer.current_path(), Some(dir.path().join("logs/2024-05-02_raw.log")));

        let day1 = fs::read_to_string(dir.path().join("logs/2024-05-01_raw.log")).unwrap();
        let day2 = fs::read_to_string(dir.path().join("logs/2024-05-02_raw.log")).unwrap();
        assert_eq!(day1.lines().count(), 2);
        assert_eq!(day2.lines().count(), 1);
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        DailyLogWriter::new(dir.path(), "_raw.log").unwrap().append(&event_at(3, "/a")).unwrap();
        DailyLogWriter::new(dir.path(), "_raw.log").unwrap().append(&event_at(3, "/b")).unwrap();

        let content = fs::read_to_string(dir.path().join("2024-05-03_raw.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn file_names_round_trip_to_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap();
        let path = raw_log_path(Path::new("logs"), "_raw.log", date);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(date_from_file_name(name, "_raw.log"), Some(date));
        assert_eq!(date_from_file_name("2024-05-03_log", "_raw.log"), None);
    }
}
