//! Public traffic statistics
//!
//! Built from the latest traffic snapshot and the relational view counters,
//! cached in two tiers and refreshed daily.

pub mod aggregator;
pub mod cache;
pub mod scheduler;
pub mod service;
pub mod summary;
pub mod types;

pub use self::scheduler::RefreshScheduler;
pub use self::service::StatsService;
pub use self::types::{RegionStat, StatsResult, TopPost};
