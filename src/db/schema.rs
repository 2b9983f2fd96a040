//! Database schema definitions

// One row per lookback window; the ETL worker upserts on lookback_days.
pub const CREATE_TRAFFIC_SNAPSHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS traffic_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lookback_days INTEGER NOT NULL,
    unique_visitors INTEGER NOT NULL DEFAULT 0,
    region_json TEXT,                -- JSON: {"Beijing": 100, "Shanghai": 50}
    generated_at BIGINT NOT NULL,    -- Unix millis
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_INDEX_SNAPSHOT_LOOKBACK: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshot_lookback ON traffic_snapshots(lookback_days)";

// Owned by the CRUD side; created here so a fresh database is queryable.
pub const CREATE_POSTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    view_count INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_POST_VIEW_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS post_view_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL,
    date TEXT NOT NULL,              -- YYYY-MM-DD (UTC)
    views INTEGER NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_INDEX_POST_VIEW_DATE: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_post_view_date ON post_view_stats(post_id, date)";

// For windowed sums (WHERE date >= ?)
pub const CREATE_INDEX_POST_VIEW_BY_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_post_view_by_date ON post_view_stats(date)";
