//! Access log line parser
//!
//! Three grammars are tried in order, without a format flag:
//! - gateway lines starting with `[GIN]`
//! - pipe-delimited raw log lines (as written by the raw log writer)
//! - whitespace-delimited custom lines ending in a region field
//!
//! A grammar that does not apply to a line reports [`ParseError::Structure`]
//! and the next one is tried. A grammar that applies but finds a bad field
//! reports [`ParseError::Field`], and the line is skipped.

mod duration;
mod scan;

pub use self::duration::{parse_duration, parse_latency};
pub use self::scan::{parse_log_file, PartialScan, ScanError};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::events::RequestEvent;

const GIN_MARKER: &str = "[GIN]";
const GIN_TIME_FORMAT: &str = "%Y/%m/%d - %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("line does not match the {0} grammar")]
    Structure(&'static str),

    #[error("invalid {field}: {value:?}")]
    Field { field: &'static str, value: String },
}

impl ParseError {
    fn field(field: &'static str, value: &str) -> Self {
        Self::Field {
            field,
            value: value.to_string(),
        }
    }
}

/// Which grammar produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    Gin,
    Pipe,
    Whitespace,
}

/// One parsed access log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency: Duration,
    pub region: Option<String>,
    pub user_agent: Option<String>,
    pub format: LineFormat,
}

impl LogRecord {
    pub fn into_event(self) -> RequestEvent {
        RequestEvent::new(self.ip, self.method, self.path, self.status)
            .with_timestamp(self.timestamp)
            .with_latency(self.latency)
            .with_user_agent(self.user_agent.unwrap_or_default())
    }
}

/// Parse one line with whichever grammar fits
pub fn parse_line(line: &str) -> Result<LogRecord, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let grammars: [fn(&str) -> Result<LogRecord, ParseError>; 3] = [parse_gin, parse_pipe, parse_whitespace];
    let mut last = ParseError::Structure("any");
    for grammar in grammars {
        match grammar(line) {
            Err(e @ ParseError::Structure(_)) => last = e,
            other => return other,
        }
    }
    Err(last)
}

/// `[GIN] 2024/01/02 - 03:04:05 | 200 | 1.2ms | 127.0.0.1 | GET "/api/posts/7"`
pub fn parse_gin(line: &str) -> Result<LogRecord, ParseError> {
    let Some(rest) = line.strip_prefix(GIN_MARKER) else {
        return Err(ParseError::Structure("gin"));
    };
    let sections: Vec<&str> = rest.split('|').map(str::trim).collect();
    if sections.len() < 5 {
        return Err(ParseError::Structure("gin"));
    }

    let naive = NaiveDateTime::parse_from_str(sections[0], GIN_TIME_FORMAT)
        .map_err(|_| ParseError::field("timestamp", sections[0]))?;
    // Ambiguous local times (DST fold) take the earlier instant
    let timestamp = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ParseError::field("timestamp", sections[0]))?
        .with_timezone(&Utc);

    let status = parse_status(sections[1])?;
    let compact: String = sections[2].chars().filter(|c| !c.is_whitespace()).collect();
    let latency = parse_duration(&compact).ok_or_else(|| ParseError::field("latency", sections[2]))?;
    let ip = sections[3].to_string();
    let (method, path) = split_method_path(sections[4]);

    Ok(LogRecord {
        timestamp,
        ip,
        method,
        path,
        status,
        latency,
        region: None,
        user_agent: None,
        format: LineFormat::Gin,
    })
}

fn split_method_path(token: &str) -> (String, String) {
    match token.find('"') {
        Some(idx) => (
            token[..idx].trim().to_string(),
            token[idx..].trim_matches('"').trim().to_string(),
        ),
        None => {
            let mut parts = token.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();
            (method, path)
        }
    }
}

/// `timestamp|ip|method|path|status|latency[|user_agent]`
pub fn parse_pipe(line: &str) -> Result<LogRecord, ParseError> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 6 {
        return Err(ParseError::Structure("pipe"));
    }

    let user_agent = (fields.len() > 6).then(|| fields[6..].join("|"));
    Ok(LogRecord {
        timestamp: parse_rfc3339(fields[0].trim())?,
        ip: fields[1].trim().to_string(),
        method: fields[2].trim().to_string(),
        path: fields[3].trim().to_string(),
        status: parse_status(fields[4])?,
        latency: parse_latency(fields[5].trim()).ok_or_else(|| ParseError::field("latency", fields[5]))?,
        region: None,
        user_agent,
        format: LineFormat::Pipe,
    })
}

/// `timestamp ip method path status latency region`
pub fn parse_whitespace(line: &str) -> Result<LogRecord, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 7 {
        return Err(ParseError::Structure("whitespace"));
    }

    Ok(LogRecord {
        timestamp: parse_rfc3339(fields[0])?,
        ip: fields[1].to_string(),
        method: fields[2].to_string(),
        path: fields[3].to_string(),
        status: parse_status(fields[4])?,
        latency: parse_latency(fields[5]).ok_or_else(|| ParseError::field("latency", fields[5]))?,
        region: Some(fields[6].to_string()),
        user_agent: None,
        format: LineFormat::Whitespace,
    })
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ParseError::field("timestamp", value))
}

fn parse_status(value: &str) -> Result<u16, ParseError> {
    value.trim().parse().map_err(|_| ParseError::field("status", value))
}
