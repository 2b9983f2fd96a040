use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ranked post in the stats response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopPost {
    pub post_id: u64,
    pub title: String,
    pub path: String,
    pub count: i64,
}

/// Share of the region histogram, 0-100 with two decimals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionStat {
    pub name: String,
    pub percentage: f64,
}

/// Body of `GET /api/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResult {
    pub total_visits: i64,
    pub unique_visitors: u64,
    pub top_posts: Vec<TopPost>,
    pub region_distribution: Vec<RegionStat>,
    pub generated_at: DateTime<Utc>,
}

/// Visit totals and top content from the relational counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitSummary {
    pub total_visits: i64,
    pub top_posts: Vec<TopPost>,
}

/// Decoded traffic snapshot row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotData {
    pub unique_visitors: u64,
    pub region_counts: BTreeMap<String, i64>,
}
