//! Concurrent whole-file parsing
//!
//! A single scanner task reads lines sequentially and dispatches them to a
//! pool of parser workers; parsed records fan back in over a results channel.
//! Cancellation is cooperative: checked at every dispatch and every send.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{parse_line, LogRecord};

/// Lines up to this size are read without reallocation; longer lines still parse.
const SCAN_BUFFER: usize = 1024 * 1024;
const CHANNEL_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("log path is empty")]
    EmptyPath,

    #[error("not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("read log file: {0}")]
    Io(#[from] io::Error),

    #[error("scan cancelled")]
    Cancelled,
}

/// A failed scan, with every record parsed before the failure
#[derive(Debug, Error)]
#[error("{error} after {} records", records.len())]
pub struct PartialScan {
    pub records: Vec<LogRecord>,
    #[source]
    pub error: ScanError,
}

impl PartialScan {
    fn new(records: Vec<LogRecord>, error: impl Into<ScanError>) -> Self {
        Self {
            records,
            error: error.into(),
        }
    }
}

/// Parse every line of a log file. Unparseable lines are skipped.
///
/// A missing file yields no records rather than an error.
pub async fn parse_log_file(path: impl AsRef<Path>, cancel: CancellationToken) -> Result<Vec<LogRecord>, PartialScan> {
    let path = path.as_ref();
    if path.to_string_lossy().trim().is_empty() {
        return Err(PartialScan::new(Vec::new(), ScanError::EmptyPath));
    }

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PartialScan::new(Vec::new(), e)),
    };
    if !metadata.is_file() {
        return Err(PartialScan::new(Vec::new(), ScanError::NotRegularFile(path.to_path_buf())));
    }
    let file = File::open(path).await.map_err(|e| PartialScan::new(Vec::new(), e))?;

    let workers = std::thread::available_parallelism().map_or(2, |n| n.get()).max(2);
    let (line_tx, line_rx) = mpsc::channel::<String>(CHANNEL_DEPTH);
    let (record_tx, mut record_rx) = mpsc::channel::<LogRecord>(CHANNEL_DEPTH);
    let skipped = Arc::new(AtomicU64::new(0));

    let scanner = tokio::spawn(scan_lines(file, line_tx, cancel.clone()));

    let line_rx = Arc::new(Mutex::new(line_rx));
    for _ in 0..workers {
        tokio::spawn(parse_lines(
            line_rx.clone(),
            record_tx.clone(),
            skipped.clone(),
            cancel.clone(),
        ));
    }
    drop(record_tx);

    let mut records = Vec::with_capacity(CHANNEL_DEPTH);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Keep what already made it into the channel
                while let Ok(record) = record_rx.try_recv() {
                    records.push(record);
                }
                return Err(PartialScan::new(records, ScanError::Cancelled));
            }
            next = record_rx.recv() => match next {
                Some(record) => records.push(record),
                None => break,
            },
        }
    }

    debug!(
        path = %path.display(),
        records = records.len(),
        skipped = skipped.load(Ordering::Relaxed),
        workers,
        "log file parsed"
    );

    match scanner.await {
        Ok(Ok(())) if cancel.is_cancelled() => Err(PartialScan::new(records, ScanError::Cancelled)),
        Ok(Ok(())) => Ok(records),
        Ok(Err(e)) => Err(PartialScan::new(records, e)),
        Err(e) => Err(PartialScan::new(records, io::Error::new(io::ErrorKind::Other, e))),
    }
}

async fn scan_lines(file: File, lines: mpsc::Sender<String>, cancel: CancellationToken) -> io::Result<()> {
    let mut reader = BufReader::with_capacity(SCAN_BUFFER, file);
    let mut buf = Vec::with_capacity(SCAN_BUFFER);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = lines.send(line) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn parse_lines(
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
    records: mpsc::Sender<LogRecord>,
    skipped: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let next = { lines.lock().await.recv().await };
        let Some(line) = next else {
            return;
        };
        let record = match parse_line(&line) {
            Ok(record) => record,
            Err(_) => {
                skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = records.send(record) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn pipe_line(i: usize) -> String {
        format!("2024-05-01T00:00:{:02}Z|10.0.0.{}|GET|/posts/{i}|200|{i}|agent\n", i % 60, i % 255)
    }

    fn write_log(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn parses_every_valid_line_and_skips_the_rest() {
        let mut lines: Vec<String> = (0..500).map(pipe_line).collect();
        lines.insert(10, "garbage\n".into());
        lines.insert(20, "\n".into());
        lines.push(r#"[GIN] 2024/01/02 - 03:04:05 | 200 | 1.2ms | 127.0.0.1 | GET "/api/posts/7""#.to_string());
        let file = write_log(&lines);

        let records = parse_log_file(file.path(), CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 501);
        let paths: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert!(paths.contains("/posts/0") && paths.contains("/posts/499") && paths.contains("/api/posts/7"));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = parse_log_file(dir.path().join("nope.log"), CancellationToken::new()).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn directories_and_empty_paths_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_log_file(dir.path(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.error, ScanError::NotRegularFile(_)));

        let err = parse_log_file("  ", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.error, ScanError::EmptyPath));
    }

    #[tokio::test]
    async fn lines_longer_than_the_buffer_are_not_truncated() {
        let agent = "a".repeat(2 * SCAN_BUFFER);
        let line = format!("2024-05-01T00:00:00Z|1.1.1.1|GET|/big|200|5|{agent}\n");
        let file = write_log(&[line, pipe_line(1)]);

        let records = parse_log_file(file.path(), CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 2);
        let big = records.iter().find(|r| r.path == "/big").unwrap();
        assert_eq!(big.user_agent.as_ref().map(String::len), Some(2 * SCAN_BUFFER));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"2024-05-01T00:00:00Z|1.1.1.1|GET|/x|200|5|bad\xff\xfeagent\n").unwrap();
        file.flush().unwrap();

        let records = parse_log_file(file.path(), CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].user_agent.as_deref().unwrap().contains('\u{fffd}'));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_results() {
        let lines: Vec<String> = (0..20_000).map(pipe_line).collect();
        let file = write_log(&lines);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = parse_log_file(file.path(), cancel).await.unwrap_err();
        assert!(matches!(err.error, ScanError::Cancelled));
        assert!(err.records.len() < lines.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_mid_file_keeps_records_already_parsed() {
        let total = 500_000;
        let content: String = (0..total).map(pipe_line).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();

        let cancel = CancellationToken::new();
        let scan = tokio::spawn(parse_log_file(file.path().to_path_buf(), cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        cancel.cancel();

        let err = scan.await.unwrap().unwrap_err();
        assert!(matches!(err.error, ScanError::Cancelled));
        assert!(!err.records.is_empty());
        assert!(err.records.len() < total);
        assert!(err.records.iter().all(|r| r.method == "GET" && r.status == 200));
    }
}
