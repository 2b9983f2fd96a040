//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:` for a private in-memory database
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "data/blog.db".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

fn default_max_connections() -> u32 {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. Empty keeps counters in process memory (single node, dev only).
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_redis_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            op_timeout_ms: default_redis_op_timeout_ms(),
        }
    }
}

fn default_redis_op_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    pub database: String,
    /// ISO country code whose visitors feed the region histogram
    #[serde(default = "default_tracked_country")]
    pub tracked_country: String,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            database: "data/GeoLite2-City.mmdb".to_string(),
            tracked_country: default_tracked_country(),
        }
    }
}

fn default_tracked_country() -> String {
    "CN".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub log_dir: PathBuf,
    pub raw_log_suffix: String,
    pub queue_capacity: usize,
    pub key_ttl_days: u32,
    pub lookback_days: u32,
    pub etl_interval_secs: u64,
    /// Budget for each counter write issued by the capture consumer
    pub capture_timeout_ms: u64,
    /// Budget for each cache read issued by the snapshot worker
    pub etl_timeout_ms: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            raw_log_suffix: "_raw.log".to_string(),
            queue_capacity: 2048,
            key_ttl_days: 45,
            lookback_days: 30,
            etl_interval_secs: 300,
            capture_timeout_ms: 500,
            etl_timeout_ms: 2000,
        }
    }
}

impl AnalyticsConfig {
    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.key_ttl_days) * 24 * 3600)
    }

    pub fn etl_interval(&self) -> Duration {
        Duration::from_secs(self.etl_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub cache_key: String,
    pub cache_ttl_secs: u64,
    pub window_days: u32,
    pub top_posts: u32,
    /// Local hour of day at which the scheduler recomputes the stats
    pub refresh_hour: u32,
    pub db_timeout_ms: u64,
    pub cache_timeout_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cache_key: "stats:summary".to_string(),
            cache_ttl_secs: 24 * 3600,
            window_days: 30,
            top_posts: 3,
            refresh_hour: 12,
            db_timeout_ms: 3000,
            cache_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `gcp` (structured Cloud Logging JSON)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("BLOG_ANALYTICS")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        let analytics = &self.analytics;
        if analytics.queue_capacity == 0 {
            anyhow::bail!("analytics.queue_capacity must be > 0");
        }
        if analytics.lookback_days == 0 || analytics.lookback_days > analytics.key_ttl_days {
            anyhow::bail!(
                "analytics.lookback_days must be between 1 and key_ttl_days ({}), got {}",
                analytics.key_ttl_days,
                analytics.lookback_days
            );
        }
        if analytics.etl_interval_secs == 0 {
            anyhow::bail!("analytics.etl_interval_secs must be > 0");
        }

        if self.stats.refresh_hour > 23 {
            anyhow::bail!("stats.refresh_hour must be 0-23, got {}", self.stats.refresh_hour);
        }
        if self.stats.top_posts == 0 {
            anyhow::bail!("stats.top_posts must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }
        if self.logging.format != "text" && self.logging.format != "gcp" {
            anyhow::bail!("Invalid logging format '{}'. Must be 'text' or 'gcp'", self.logging.format);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn lookback_longer_than_retention_is_rejected() {
        let mut config = Config::default();
        config.analytics.lookback_days = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn refresh_hour_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.stats.refresh_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_ttl_is_whole_days() {
        let analytics = AnalyticsConfig::default();
        assert_eq!(analytics.key_ttl(), Duration::from_secs(45 * 86_400));
    }
}
