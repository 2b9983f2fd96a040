//! Inputs of the stats aggregation, read from the relational store

use anyhow::Result;
use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;
use tracing::warn;

use super::types::{SnapshotData, TopPost, VisitSummary};
use crate::db::{Database, PostViewRank};

/// Visits and top posts over the last `days` days (0 = all days), falling back
/// to the all-time post counters when the daily counters are empty.
pub async fn build_visit_summary(db: &Database, days: u32, top_n: u32, today: NaiveDate) -> Result<VisitSummary> {
    let top_n = top_n.max(1);
    let since = window_start(today, days);

    let mut total = db.sum_visits_since(since).await?;
    let mut ranks = db.top_posts_by_views_since(since, top_n).await?;

    if total == 0 {
        total = db.sum_all_post_views().await?;
    }
    if ranks.is_empty() {
        ranks = db.top_posts_by_total_views(top_n).await?;
    }

    Ok(VisitSummary {
        total_visits: total,
        top_posts: ranks.into_iter().map(top_post).collect(),
    })
}

fn window_start(today: NaiveDate, days: u32) -> NaiveDate {
    if days == 0 {
        return NaiveDate::MIN;
    }
    today
        .checked_sub_days(Days::new(u64::from(days - 1)))
        .unwrap_or(NaiveDate::MIN)
}

fn top_post(rank: PostViewRank) -> TopPost {
    TopPost {
        path: format!("/posts/{}", rank.post_id),
        post_id: rank.post_id,
        title: rank.title,
        count: rank.views,
    }
}

/// Snapshot for a window; a missing row reads as zero and a corrupt histogram as empty
pub async fn load_traffic_snapshot(db: &Database, lookback_days: u32) -> Result<SnapshotData> {
    let Some(snapshot) = db.get_traffic_snapshot(lookback_days).await? else {
        return Ok(SnapshotData::default());
    };

    let region_counts = match snapshot.region_json.as_deref().map(str::trim) {
        None | Some("") => BTreeMap::new(),
        Some(json) => match serde_json::from_str::<BTreeMap<String, Option<i64>>>(json) {
            Ok(counts) => counts
                .into_iter()
                .filter_map(|(region, count)| count.map(|c| (region, c)))
                .collect(),
            Err(e) => {
                warn!(window = lookback_days, error = %e, "corrupt region histogram in traffic snapshot");
                BTreeMap::new()
            }
        },
    };

    Ok(SnapshotData {
        unique_visitors: snapshot.unique_visitors,
        region_counts,
    })
}
