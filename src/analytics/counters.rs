//! Real-time per-day counters in the key-value cache
//!
//! Per calendar day (UTC) three keys are maintained, all expiring after the
//! retention TTL:
//! - `analytics:uv:<YYYYMMDD>`: set of visitor IPs
//! - `analytics:req:<YYYYMMDD>`: request counter
//! - `analytics:region:<YYYYMMDD>`: region name -> request count

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::events::RequestEvent;
use crate::geoip::SharedResolver;
use crate::kv::{with_timeout, KvOp, SharedStore, StoreError};

pub const UV_KEY_PREFIX: &str = "analytics:uv:";
pub const REQ_KEY_PREFIX: &str = "analytics:req:";
pub const REGION_KEY_PREFIX: &str = "analytics:region:";

const DAY_FORMAT: &str = "%Y%m%d";

/// Cache keys for one calendar day
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayKeys {
    pub visitors: String,
    pub requests: String,
    pub regions: String,
}

impl DayKeys {
    pub fn for_date(date: NaiveDate) -> Self {
        let day = date.format(DAY_FORMAT);
        Self {
            visitors: format!("{UV_KEY_PREFIX}{day}"),
            requests: format!("{REQ_KEY_PREFIX}{day}"),
            regions: format!("{REGION_KEY_PREFIX}{day}"),
        }
    }
}

/// Date of a visitor-set key, `None` for anything else
pub fn date_from_visitor_key(key: &str) -> Option<NaiveDate> {
    let day = key.strip_prefix(UV_KEY_PREFIX)?;
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

/// Writes and reads the per-day counters
pub struct RealtimeCounters {
    store: SharedStore,
    resolver: SharedResolver,
    ttl: Duration,
    op_timeout: Duration,
}

impl RealtimeCounters {
    pub fn new(store: SharedStore, resolver: SharedResolver, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            store,
            resolver,
            ttl,
            op_timeout,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Fold one event into its day's counters in a single round trip
    pub async fn record(&self, event: &RequestEvent) -> Result<(), StoreError> {
        let region = if event.ip.is_empty() {
            None
        } else {
            let lookup = self.resolver.resolve(&event.ip);
            if lookup.tracked && !lookup.is_sentinel() {
                Some(lookup.name)
            } else {
                debug!(ip = %event.ip, region = %lookup.name, "region not counted");
                None
            }
        };

        let ops = plan_ops(event, region.as_deref(), self.ttl);
        with_timeout(self.op_timeout, self.store.exec(&ops)).await
    }

    pub async fn day_visitors(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        self.visitors_at(&DayKeys::for_date(date).visitors).await
    }

    pub async fn visitors_at(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        let members = with_timeout(self.op_timeout, self.store.set_members(key)).await?;
        Ok(members.into_iter().filter(|ip| !ip.is_empty()).collect())
    }

    /// Region histogram for a day; fields with non-numeric counts are skipped
    pub async fn day_regions(&self, date: NaiveDate) -> Result<HashMap<String, i64>, StoreError> {
        let key = DayKeys::for_date(date).regions;
        let fields = with_timeout(self.op_timeout, self.store.hash_fields(&key)).await?;
        Ok(fields
            .into_iter()
            .filter(|(region, _)| !region.is_empty())
            .filter_map(|(region, count)| count.parse::<i64>().ok().map(|n| (region, n)))
            .collect())
    }

    pub async fn day_requests(&self, date: NaiveDate) -> Result<i64, StoreError> {
        let key = DayKeys::for_date(date).requests;
        let count = with_timeout(self.op_timeout, self.store.counter(&key)).await?;
        Ok(count.unwrap_or(0))
    }
}

/// Cache writes for one event. Every touched key gets its TTL refreshed.
pub fn plan_ops(event: &RequestEvent, region: Option<&str>, ttl: Duration) -> Vec<KvOp> {
    let keys = DayKeys::for_date(event.day());
    let mut ops = Vec::with_capacity(6);

    if !event.ip.is_empty() {
        ops.push(KvOp::SetAdd {
            key: keys.visitors.clone(),
            member: event.ip.clone(),
        });
        ops.push(KvOp::Expire { key: keys.visitors, ttl });
    }

    ops.push(KvOp::Incr { key: keys.requests.clone() });
    ops.push(KvOp::Expire { key: keys.requests, ttl });

    if let Some(region) = region.filter(|r| !r.is_empty()) {
        ops.push(KvOp::HashIncr {
            key: keys.regions.clone(),
            field: region.to_string(),
            by: 1,
        });
        ops.push(KvOp::Expire { key: keys.regions, ttl });
    }

    ops
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use crate::geoip::{RegionLookup, RegionResolver};

    /// Resolver backed by a fixed table; unknown IPs are untracked
    pub struct StaticRegions(pub HashMap<String, String>);

    impl StaticRegions {
        pub fn of(pairs: &[(&str, &str)]) -> Self {
            Self(pairs.iter().map(|(ip, r)| (ip.to_string(), r.to_string())).collect())
        }
    }

    impl RegionResolver for StaticRegions {
        fn resolve(&self, ip: &str) -> RegionLookup {
            match self.0.get(ip) {
                Some(name) => RegionLookup { tracked: true, name: name.clone() },
                None => RegionLookup::unknown(),
            }
        }
    }
}
