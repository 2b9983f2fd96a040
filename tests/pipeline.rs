//! Capture -> counters -> snapshot -> stats, end to end on in-process stores

use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use blog_analytics::analytics::capture::{self, CaptureSinks};
use blog_analytics::analytics::counters::RealtimeCounters;
use blog_analytics::analytics::diagnostics::Diagnostics;
use blog_analytics::analytics::etl::{SnapshotWorker, ALL_TIME_WINDOW};
use blog_analytics::analytics::raw_log::DailyLogWriter;
use blog_analytics::analytics::replay::{DateRange, Replayer};
use blog_analytics::config::{DatabaseConfig, StatsConfig};
use blog_analytics::db::Database;
use blog_analytics::events::RequestEvent;
use blog_analytics::geoip::{RegionLookup, RegionResolver};
use blog_analytics::kv::MemoryStore;
use blog_analytics::stats::StatsService;

struct FixedRegions(HashMap<&'static str, &'static str>);

impl RegionResolver for FixedRegions {
    fn resolve(&self, ip: &str) -> RegionLookup {
        match self.0.get(ip) {
            Some(name) => RegionLookup {
                tracked: true,
                name: name.to_string(),
            },
            None => RegionLookup::unknown(),
        }
    }
}

fn resolver() -> Arc<FixedRegions> {
    Arc::new(FixedRegions(HashMap::from([
        ("1.1.1.1", "Beijing"),
        ("2.2.2.2", "Shanghai"),
        ("3.3.3.3", "Beijing"),
    ])))
}

fn counters(store: Arc<MemoryStore>) -> Arc<RealtimeCounters> {
    Arc::new(RealtimeCounters::new(
        store,
        resolver(),
        Duration::from_secs(45 * 86_400),
        Duration::from_millis(500),
    ))
}

async fn database() -> Database {
    let config = DatabaseConfig {
        url: ":memory:".to_string(),
        ..DatabaseConfig::default()
    };
    let db = Database::new(&config).await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn event(ip: &str, path: &str, minute: u32) -> RequestEvent {
    RequestEvent::new(ip.into(), "GET".into(), path.into(), 200)
        .with_timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap())
        .with_latency(Duration::from_micros(850))
        .with_user_agent("Mozilla/5.0".into())
}

#[tokio::test]
async fn captured_requests_reach_the_stats_response() {
    let log_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let counters = counters(store.clone());
    let diagnostics = Arc::new(Diagnostics::new());
    let db = database().await;
    let post = db.insert_post("Hello", 0).await.unwrap();
    db.increment_post_view(post, Utc::now()).await.unwrap();

    // Capture
    let (capture, queue) = capture::channel(64, diagnostics.clone());
    let consumer = capture::spawn_consumer(
        queue,
        CaptureSinks {
            raw_log: Some(Arc::new(DailyLogWriter::new(log_dir.path(), "_raw.log").unwrap())),
            counters: counters.clone(),
            diagnostics: diagnostics.clone(),
        },
    );
    for (i, ip) in ["1.1.1.1", "1.1.1.1", "2.2.2.2", "3.3.3.3", "9.9.9.9"].iter().enumerate() {
        assert!(capture.capture(event(ip, "/api/posts/1", i as u32)));
    }
    drop(capture);
    consumer.await.unwrap();

    assert_eq!(counters.day_requests(day()).await.unwrap(), 5);
    assert_eq!(counters.day_visitors(day()).await.unwrap().len(), 4);
    let raw = std::fs::read_to_string(log_dir.path().join("2024-06-01_raw.log")).unwrap();
    assert_eq!(raw.lines().count(), 5);

    // Snapshot
    let worker = SnapshotWorker::new(
        counters.clone(),
        db.clone(),
        30,
        Duration::from_secs(300),
        Duration::from_secs(2),
        diagnostics.clone(),
    );
    let outcome = worker.run_once(day()).await;
    assert!(outcome.window_saved && outcome.all_time_saved);
    let all_time = db.get_traffic_snapshot(ALL_TIME_WINDOW).await.unwrap().unwrap();
    assert_eq!(all_time.unique_visitors, 4);

    // Stats
    let stats = StatsService::new(&StatsConfig::default(), db.clone(), store.clone(), diagnostics.clone());
    let result = stats.get_stats().await.unwrap();
    assert_eq!(result.unique_visitors, 4);
    assert_eq!(result.total_visits, 1);
    assert_eq!(result.top_posts[0].path, format!("/posts/{post}"));

    let regions: Vec<(&str, f64)> = result
        .region_distribution
        .iter()
        .map(|r| (r.name.as_str(), r.percentage))
        .collect();
    assert_eq!(regions, vec![("Beijing", 75.0), ("Shanghai", 25.0)]);

    // Served from cache the second time
    assert_eq!(stats.get_stats().await.unwrap(), result);
    let snap = diagnostics.snapshot();
    assert_eq!(snap.events_captured, 5);
    assert_eq!(snap.stats_recomputes, 1);
    assert_eq!(snap.etl_fold_errors, 0);
}

#[tokio::test]
async fn replaying_the_raw_log_rebuilds_the_counters() {
    let log_dir = tempfile::tempdir().unwrap();
    let writer = DailyLogWriter::new(log_dir.path(), "_raw.log").unwrap();
    for (i, ip) in ["1.1.1.1", "2.2.2.2", "2.2.2.2"].iter().enumerate() {
        writer.append(&event(ip, "/", i as u32)).unwrap();
    }

    let counters = counters(Arc::new(MemoryStore::new()));
    let report = Replayer::new(&counters, log_dir.path(), "_raw.log")
        .run(DateRange::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files, 1);
    assert_eq!(report.records, 3);
    assert_eq!(counters.day_requests(day()).await.unwrap(), 3);
    assert_eq!(counters.day_visitors(day()).await.unwrap().len(), 2);
    let regions = counters.day_regions(day()).await.unwrap();
    assert_eq!(regions.get("Shanghai"), Some(&2));
}
