//! Redis-backed key-value store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use super::{KvOp, KvStore, ScanCursor, ScanPage, StoreError};

/// Redis store with a lazily established, auto-reconnecting connection.
///
/// Opening the client only validates the URL; a Redis that is down at startup
/// surfaces as per-call errors instead of preventing the process from booting.
pub struct RedisStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await?;
                info!("Connected to redis");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn exec(&self, ops: &[KvOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                KvOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                KvOp::Incr { key } => {
                    pipe.incr(key, 1).ignore();
                }
                KvOp::HashIncr { key, field, by } => {
                    pipe.hincr(key, field, *by).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl.as_secs() as i64).ignore();
                }
            }
        }
        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn hash_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let mut conn = self.connection().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor.0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage {
            keys,
            next: (next != 0).then_some(ScanCursor(next)),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }
}
