//! Request telemetry events

use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

/// One completed HTTP request, as seen by the capture layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency: Duration,
    pub user_agent: String,
}

impl RequestEvent {
    pub fn new(ip: String, method: String, path: String, status: u16) -> Self {
        Self {
            timestamp: Utc::now(),
            ip,
            method,
            path,
            status,
            latency: Duration::ZERO,
            user_agent: String::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Calendar day (UTC) the event is bucketed under
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}
