//! Key-value cache abstraction
//!
//! The real-time counters and the stats cache both talk to this trait, so the
//! Redis backend can be swapped for the in-process [`MemoryStore`] in tests or
//! single-node deployments.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One write in a batched round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    SetAdd { key: String, member: String },
    Incr { key: String },
    HashIncr { key: String, field: String, by: i64 },
    Expire { key: String, ttl: Duration },
}

/// Opaque position in an incremental key scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanCursor(pub(crate) u64);

impl ScanCursor {
    pub const START: ScanCursor = ScanCursor(0);
}

/// One page of an incremental key scan; `next` is `None` once the scan is complete
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub next: Option<ScanCursor>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Apply all ops in a single round trip where the backend supports it
    async fn exec(&self, ops: &[KvOp]) -> Result<(), StoreError>;

    /// Members of a set; missing key yields an empty list
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Raw field values of a hash; missing key yields an empty map
    async fn hash_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Integer counter value, `None` if absent
    async fn counter(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Fetch one page of keys matching a glob pattern
    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn KvStore>;

/// Run a store call under an explicit budget
pub async fn with_timeout<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl KvStore for Stalled {
        async fn exec(&self, _ops: &[KvOp]) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn set_members(&self, _key: &str) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }
        async fn hash_fields(&self, _key: &str) -> Result<HashMap<String, String>, StoreError> {
            std::future::pending().await
        }
        async fn counter(&self, _key: &str) -> Result<Option<i64>, StoreError> {
            std::future::pending().await
        }
        async fn scan(&self, _c: ScanCursor, _p: &str, _n: usize) -> Result<ScanPage, StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            std::future::pending().await
        }
        async fn set_ex(&self, _key: &str, _v: &[u8], _ttl: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn slow_backend_is_cut_off() {
        let budget = Duration::from_millis(20);
        let result = with_timeout(budget, Stalled.get("k")).await;
        assert!(matches!(result, Err(StoreError::Timeout(d)) if d == budget));
    }
}
