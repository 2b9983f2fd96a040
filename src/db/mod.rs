//! Relational store: traffic snapshots and per-post daily view counters

mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Durable rollup of the real-time counters for one lookback window
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficSnapshot {
    /// 0 means all history still present in the counter cache
    pub lookback_days: u32,
    pub unique_visitors: u64,
    pub region_json: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Post ranked by view count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostViewRank {
    pub post_id: u64,
    pub title: String,
    pub views: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms));

        let pool = if config.url == ":memory:" {
            // Every connection to :memory: is its own database, so pin a single one.
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            if let Some(parent) = Path::new(&config.url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating database directory {}", parent.display()))?;
                }
            }
            options
                .max_connections(config.max_connections.max(1))
                .connect(&format!("sqlite:{}?mode=rwc", config.url))
                .await?
        };
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for statement in [
            schema::CREATE_TRAFFIC_SNAPSHOTS_TABLE,
            schema::CREATE_INDEX_SNAPSHOT_LOOKBACK,
            schema::CREATE_POSTS_TABLE,
            schema::CREATE_POST_VIEW_STATS_TABLE,
            schema::CREATE_INDEX_POST_VIEW_DATE,
            schema::CREATE_INDEX_POST_VIEW_BY_DATE,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert or replace the snapshot for `lookback_days`. Never creates a second row per window.
    pub async fn upsert_traffic_snapshot(
        &self,
        lookback_days: u32,
        unique_visitors: u64,
        region_counts: &BTreeMap<String, i64>,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        let region_json = serde_json::to_string(region_counts)?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO traffic_snapshots (lookback_days, unique_visitors, region_json, generated_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(lookback_days) DO UPDATE SET
                unique_visitors = excluded.unique_visitors,
                region_json = excluded.region_json,
                generated_at = excluded.generated_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(i64::from(lookback_days))
        .bind(unique_visitors as i64)
        .bind(region_json)
        .bind(generated_at.timestamp_millis())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_traffic_snapshot(&self, lookback_days: u32) -> Result<Option<TrafficSnapshot>> {
        let row: Option<(i64, i64, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT lookback_days, unique_visitors, region_json, generated_at
            FROM traffic_snapshots
            WHERE lookback_days = ?
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(i64::from(lookback_days))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(days, unique_visitors, region_json, generated_at)| TrafficSnapshot {
            lookback_days: days.max(0) as u32,
            unique_visitors: unique_visitors.max(0) as u64,
            region_json,
            generated_at: DateTime::from_timestamp_millis(generated_at).unwrap_or_default(),
        }))
    }

    pub async fn count_traffic_snapshots(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM traffic_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Add one view to a post's counter for the UTC day of `viewed_at`
    pub async fn increment_post_view(&self, post_id: u64, viewed_at: DateTime<Utc>) -> Result<()> {
        let date = viewed_at.date_naive().format("%Y-%m-%d").to_string();
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO post_view_stats (post_id, date, views, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(post_id, date) DO UPDATE SET
                views = post_view_stats.views + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(post_id as i64)
        .bind(date)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sum_visits_since(&self, since: NaiveDate) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(views), 0) FROM post_view_stats WHERE date >= ?",
        )
        .bind(since.format("%Y-%m-%d").to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn top_posts_by_views_since(&self, since: NaiveDate, limit: u32) -> Result<Vec<PostViewRank>> {
        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT pvs.post_id, posts.title, COALESCE(SUM(pvs.views), 0) AS views
            FROM post_view_stats pvs
            JOIN posts ON posts.id = pvs.post_id
            WHERE pvs.date >= ?
            GROUP BY pvs.post_id, posts.title
            ORDER BY views DESC, pvs.post_id ASC
            LIMIT ?
            "#,
        )
        .bind(since.format("%Y-%m-%d").to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_rank).collect())
    }

    /// All-time views from the posts table, used when the daily counters are empty
    pub async fn sum_all_post_views(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(SUM(view_count), 0) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn top_posts_by_total_views(&self, limit: u32) -> Result<Vec<PostViewRank>> {
        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            "SELECT id, title, view_count FROM posts ORDER BY view_count DESC, id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_rank).collect())
    }

    /// Insert a post row; the blog's CRUD layer normally owns this table.
    pub async fn insert_post(&self, title: &str, view_count: i64) -> Result<u64> {
        let result = sqlx::query("INSERT INTO posts (title, view_count) VALUES (?, ?)")
            .bind(title)
            .bind(view_count)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    #[cfg(test)]
    pub(crate) async fn set_snapshot_region_json(&self, lookback_days: u32, region_json: &str) -> Result<()> {
        sqlx::query("UPDATE traffic_snapshots SET region_json = ? WHERE lookback_days = ?")
            .bind(region_json)
            .bind(i64::from(lookback_days))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn into_rank((post_id, title, views): (i64, String, i64)) -> PostViewRank {
    PostViewRank {
        post_id: post_id.max(0) as u64,
        title,
        views,
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let config = DatabaseConfig {
        url: ":memory:".to_string(),
        ..DatabaseConfig::default()
    };
    let db = Database::new(&config).await.unwrap();
    db.run_migrations().await.unwrap();
    db
}
