//! GeoIP region lookup using MaxMind GeoLite2-City database

use cached::{Cached, SizedCache};
use maxminddb::{geoip2, Reader};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Region name for addresses that cannot be resolved
pub const UNKNOWN_REGION: &str = "UNKNOWN";
/// Region name for loopback addresses
pub const LOCAL_REGION: &str = "LOCAL";

const LOOKUP_CACHE_SIZE: usize = 10_000;

/// Result of resolving a client IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLookup {
    /// Whether the address belongs to the tracked country
    pub tracked: bool,
    /// Subdivision, city or country name, or one of the sentinels
    pub name: String,
}

impl RegionLookup {
    pub fn unknown() -> Self {
        Self {
            tracked: false,
            name: UNKNOWN_REGION.to_string(),
        }
    }

    pub fn local() -> Self {
        Self {
            tracked: false,
            name: LOCAL_REGION.to_string(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.name == UNKNOWN_REGION || self.name == LOCAL_REGION
    }
}

/// Resolves an IP address to a human-readable region
pub trait RegionResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> RegionLookup;
}

/// GeoIP reader wrapper
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
    tracked_country: String,
    memo: Mutex<SizedCache<String, RegionLookup>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the database if available
    pub fn new(database_path: &str, tracked_country: &str) -> Self {
        let path = Path::new(database_path);
        let reader = if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            warn!("Download GeoLite2-City.mmdb from MaxMind and place it at: {}", database_path);
            None
        } else {
            match Reader::open_readfile(path) {
                Ok(reader) => {
                    info!("GeoIP database loaded: {}", database_path);
                    Some(reader)
                }
                Err(e) => {
                    warn!("Failed to load GeoIP database: {}", e);
                    None
                }
            }
        };

        Self {
            reader,
            tracked_country: tracked_country.to_uppercase(),
            memo: Mutex::new(SizedCache::with_size(LOOKUP_CACHE_SIZE)),
        }
    }

    /// Check if the GeoIP database is loaded
    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }

    fn lookup_uncached(&self, ip_addr: IpAddr) -> RegionLookup {
        let Some(reader) = self.reader.as_ref() else {
            return RegionLookup::unknown();
        };
        let city: geoip2::City = match reader.lookup(ip_addr) {
            Ok(city) => city,
            Err(_) => return RegionLookup::unknown(),
        };

        let tracked = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .is_some_and(|code| code.eq_ignore_ascii_case(&self.tracked_country));

        // Province first, then city, then country
        let name = city
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|s| localized_name(s.names.as_ref()))
            .or_else(|| city.city.as_ref().and_then(|c| localized_name(c.names.as_ref())))
            .or_else(|| city.country.as_ref().and_then(|c| localized_name(c.names.as_ref())));

        match name {
            Some(name) => RegionLookup { tracked, name },
            None => RegionLookup {
                tracked,
                name: UNKNOWN_REGION.to_string(),
            },
        }
    }
}

impl RegionResolver for GeoIp {
    fn resolve(&self, ip: &str) -> RegionLookup {
        let ip = ip.trim();
        if ip.is_empty() {
            return RegionLookup::unknown();
        }
        let Ok(ip_addr) = ip.parse::<IpAddr>() else {
            return RegionLookup::unknown();
        };
        if ip_addr.is_loopback() {
            return RegionLookup::local();
        }
        if is_private_ip(&ip_addr) {
            return RegionLookup::unknown();
        }

        let key = ip.to_string();
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(hit) = memo.cache_get(&key) {
                return hit.clone();
            }
        }

        let lookup = self.lookup_uncached(ip_addr);
        if let Ok(mut memo) = self.memo.lock() {
            memo.cache_set(key, lookup.clone());
        }
        lookup
    }
}

fn localized_name(names: Option<&BTreeMap<&str, &str>>) -> Option<String> {
    let names = names?;
    ["zh-CN", "en"]
        .iter()
        .filter_map(|lang| names.get(lang))
        .find(|name| !name.is_empty())
        .map(|name| name.to_string())
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
            || ipv4.is_loopback()
            || ipv4.is_link_local()
            || ipv4.is_broadcast()
            || ipv4.is_documentation()
            || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
            || ipv6.is_unspecified()
        }
    }
}

/// Thread-safe resolver handle
pub type SharedResolver = Arc<dyn RegionResolver>;
