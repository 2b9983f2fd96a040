//! Combine a traffic snapshot and a visit summary into the stats response

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::types::{RegionStat, SnapshotData, StatsResult, VisitSummary};

pub fn aggregate(snapshot: &SnapshotData, summary: VisitSummary, generated_at: DateTime<Utc>) -> StatsResult {
    StatsResult {
        total_visits: summary.total_visits,
        unique_visitors: snapshot.unique_visitors,
        top_posts: summary.top_posts,
        region_distribution: region_distribution(&snapshot.region_counts),
        generated_at,
    }
}

/// Each region's share of the histogram total, highest count first.
/// Regions with a non-positive count are left out.
pub fn region_distribution(counts: &BTreeMap<String, i64>) -> Vec<RegionStat> {
    let mut entries: Vec<(&String, i64)> = counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(name, count)| (name, *count))
        .collect();
    let total: i64 = entries.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return Vec::new();
    }

    // BTreeMap order already breaks ties by name; the sort is stable
    entries.sort_by_key(|(_, count)| Reverse(*count));
    entries
        .into_iter()
        .map(|(name, count)| RegionStat {
            name: name.clone(),
            percentage: round2(count as f64 * 100.0 / total as f64),
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
