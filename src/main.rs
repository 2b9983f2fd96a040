//! blog-analytics - request analytics and traffic stats for the blog API
//!
//! - `serve`: capture requests, run the snapshot worker and serve `/api/stats`
//! - `replay`: re-apply archived raw logs to the real-time counters

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use blog_analytics::analytics::counters::RealtimeCounters;
use blog_analytics::analytics::diagnostics::Diagnostics;
use blog_analytics::analytics::replay::{DateRange, Replayer};
use blog_analytics::analytics::Analytics;
use blog_analytics::config::{Config, LoggingConfig, RedisConfig};
use blog_analytics::db::Database;
use blog_analytics::geoip::{GeoIp, SharedResolver};
use blog_analytics::kv::{MemoryStore, RedisStore, SharedStore};
use blog_analytics::stats::{RefreshScheduler, StatsService};
use blog_analytics::web::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "blog-analytics", version, about = "Request analytics for the blog API")]
struct Cli {
    /// Configuration file (TOML); missing file means defaults + environment
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server and background analytics workers (default)
    Serve,
    /// Re-apply raw log files to the real-time counters
    Replay {
        /// Directory holding `YYYY-MM-DD_raw.log` files; defaults to analytics.log_dir
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// First date to replay, inclusive
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last date to replay, inclusive
        #[arg(long)]
        end: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("Invalid configuration")?;
    init_logging(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Replay { log_dir, start, end } => {
            let dir = log_dir.unwrap_or_else(|| config.analytics.log_dir.clone());
            replay(config, dir, DateRange { start, end }).await
        }
    }
}

/// `logging.format = "gcp"` emits structured Cloud Logging JSON. RUST_LOG overrides the level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));
    if logging.format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Redis when configured and the URL is usable, otherwise the in-process store
fn open_store(redis: &RedisConfig) -> SharedStore {
    if redis.url.trim().is_empty() {
        warn!("No redis.url configured, using in-process key-value store");
        return Arc::new(MemoryStore::new());
    }
    match RedisStore::open(&redis.url) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "Invalid redis.url, falling back to in-process key-value store");
            Arc::new(MemoryStore::new())
        }
    }
}

fn open_geoip(config: &Config) -> SharedResolver {
    let geoip = GeoIp::new(&config.geoip.database, &config.geoip.tracked_country);
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found), regions will not be counted");
    }
    Arc::new(geoip)
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting blog-analytics...");

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let store = open_store(&config.redis);
    let resolver = open_geoip(&config);
    let diagnostics = Arc::new(Diagnostics::new());

    let analytics = Analytics::new(
        config.analytics.clone(),
        store.clone(),
        resolver,
        db.clone(),
        diagnostics.clone(),
    );
    let capture = analytics.capture();
    analytics.start_etl();
    info!("Analytics pipeline started");

    let stats = Arc::new(StatsService::new(&config.stats, db, store, diagnostics.clone()));
    Arc::new(RefreshScheduler::new(stats.clone(), config.stats.refresh_hour)).start();
    web::warm_cache(stats.clone());

    let state = Arc::new(AppState { stats, diagnostics });
    web::start_server(&config, state, capture).await
}

async fn replay(config: Config, dir: PathBuf, range: DateRange) -> Result<()> {
    let store = open_store(&config.redis);
    let counters = RealtimeCounters::new(
        store,
        open_geoip(&config),
        config.analytics.key_ttl(),
        Duration::from_millis(config.redis.op_timeout_ms),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping replay");
            on_signal.cancel();
        }
    });

    let report = Replayer::new(&counters, &dir, &config.analytics.raw_log_suffix)
        .run(range, cancel)
        .await?;
    info!(
        files = report.files,
        records = report.records,
        failed = report.failed_files.len(),
        "Replay finished"
    );
    if !report.failed_files.is_empty() {
        anyhow::bail!("{} file(s) failed to replay", report.failed_files.len());
    }
    Ok(())
}
