//! Blog request analytics
//!
//! Captures every HTTP request, keeps per-day real-time counters in a
//! key-value cache, snapshots them into SQLite and serves cached traffic
//! statistics.

pub mod analytics;
pub mod config;
pub mod db;
pub mod events;
pub mod geoip;
pub mod kv;
pub mod parser;
pub mod stats;
pub mod web;
