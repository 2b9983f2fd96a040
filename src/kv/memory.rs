//! In-process key-value store with per-key expiry

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{KvOp, KvStore, ScanCursor, ScanPage, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Set(HashSet<String>),
    Int(i64),
    Hash(HashMap<String, i64>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Single-node stand-in for Redis.
///
/// Keys are kept ordered and a scan cursor names the last key examined, so a
/// scan resumes after that key even when earlier keys expire in between.
/// `set_available(false)` makes every call fail, simulating an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    scans: Mutex<HashMap<u64, String>>,
    next_scan: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Remaining time to live of a key, if it exists and has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        let now = Instant::now();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn resume_key(&self, cursor: ScanCursor) -> Result<Option<String>, StoreError> {
        if cursor == ScanCursor::START {
            return Ok(None);
        }
        let mut scans = self
            .scans
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        scans
            .remove(&cursor.0)
            .map(Some)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown scan cursor {}", cursor.0)))
    }

    fn save_resume_key(&self, key: String) -> Result<ScanCursor, StoreError> {
        let id = self.next_scan.fetch_add(1, Ordering::Relaxed) + 1;
        let mut scans = self
            .scans
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        scans.insert(id, key);
        Ok(ScanCursor(id))
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Entry>, Instant) -> T) -> Result<T, StoreError> {
        self.check()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        Ok(f(&mut entries, now))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Unavailable(format!("WRONGTYPE operation against key {key}"))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn exec(&self, ops: &[KvOp]) -> Result<(), StoreError> {
        self.with_entries(|entries, now| {
            for op in ops {
                match op {
                    KvOp::SetAdd { key, member } => {
                        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                            value: Value::Set(HashSet::new()),
                            expires_at: None,
                        });
                        match &mut entry.value {
                            Value::Set(set) => {
                                set.insert(member.clone());
                            }
                            _ => return Err(wrong_type(key)),
                        }
                    }
                    KvOp::Incr { key } => {
                        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                            value: Value::Int(0),
                            expires_at: None,
                        });
                        match &mut entry.value {
                            Value::Int(n) => *n += 1,
                            _ => return Err(wrong_type(key)),
                        }
                    }
                    KvOp::HashIncr { key, field, by } => {
                        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                            value: Value::Hash(HashMap::new()),
                            expires_at: None,
                        });
                        match &mut entry.value {
                            Value::Hash(map) => *map.entry(field.clone()).or_insert(0) += by,
                            _ => return Err(wrong_type(key)),
                        }
                    }
                    KvOp::Expire { key, ttl } => {
                        if let Some(entry) = entries.get_mut(key) {
                            entry.expires_at = Some(now + *ttl);
                        }
                    }
                }
            }
            Ok(())
        })?
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })?
    }

    async fn hash_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_entries(|entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()),
            Some(_) => Err(wrong_type(key)),
        })?
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.with_entries(|entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Int(n)) => Ok(Some(*n)),
            Some(_) => Err(wrong_type(key)),
        })?
    }

    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let exact = !pattern.ends_with('*');
        let count = count.max(1);
        let after = self.resume_key(cursor)?;

        let (keys, last, more) = self.with_entries(|entries, _| {
            let lower = match &after {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            let mut examined = entries.range((lower, Bound::Unbounded)).map(|(k, _)| k);
            let page: Vec<&String> = examined.by_ref().take(count).collect();
            let more = examined.next().is_some();
            let last = page.last().map(|k| k.to_string());
            let keys = page
                .into_iter()
                .filter(|k| if exact { k.as_str() == prefix } else { k.starts_with(prefix) })
                .cloned()
                .collect::<Vec<_>>();
            (keys, last, more)
        })?;

        let next = match last {
            Some(key) if more => Some(self.save_resume_key(key)?),
            _ => None,
        };
        Ok(ScanPage { keys, next })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_entries(|entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        })?
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Bytes(value.to_vec()),
                    expires_at: Some(now + ttl),
                },
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_applies_every_op() {
        let store = MemoryStore::new();
        let ops = vec![
            KvOp::SetAdd { key: "s".into(), member: "a".into() },
            KvOp::SetAdd { key: "s".into(), member: "a".into() },
            KvOp::Incr { key: "n".into() },
            KvOp::Incr { key: "n".into() },
            KvOp::HashIncr { key: "h".into(), field: "x".into(), by: 3 },
            KvOp::Expire { key: "n".into(), ttl: Duration::from_secs(60) },
        ];
        store.exec(&ops).await.unwrap();

        assert_eq!(store.set_members("s").await.unwrap(), vec!["a".to_string()]);
        assert_eq!(store.counter("n").await.unwrap(), Some(2));
        assert_eq!(store.hash_fields("h").await.unwrap().get("x").map(String::as_str), Some("3"));
        assert!(store.ttl("n").is_some());
        assert!(store.ttl("s").is_none());
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store.set_ex("k", b"v", Duration::from_millis(10)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let store = MemoryStore::new();
        for i in 0..25 {
            let ops = [KvOp::Incr { key: format!("a:{i:02}") }, KvOp::Incr { key: format!("b:{i:02}") }];
            store.exec(&ops).await.unwrap();
        }

        let mut cursor = ScanCursor::START;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store.scan(cursor, "a:*", 10).await.unwrap();
            seen.extend(page.keys);
            pages += 1;
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().all(|k| k.starts_with("a:")));
        assert_eq!(pages, 5);
    }

    #[tokio::test]
    async fn scan_keeps_keys_when_earlier_ones_expire() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.exec(&[KvOp::Incr { key: format!("a:{i:02}") }]).await.unwrap();
        }

        let first = store.scan(ScanCursor::START, "a:*", 10).await.unwrap();
        let mut seen = first.keys;
        store
            .exec(&[KvOp::Expire { key: "a:00".into(), ttl: Duration::ZERO }])
            .await
            .unwrap();

        let mut cursor = first.next;
        while let Some(c) = cursor {
            let page = store.scan(c, "a:*", 10).await.unwrap();
            seen.extend(page.keys);
            cursor = page.next;
        }

        let expected: Vec<String> = (0..25).map(|i| format!("a:{i:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn unknown_scan_cursor_is_an_error() {
        let store = MemoryStore::new();
        assert!(store.scan(ScanCursor(42), "a:*", 10).await.is_err());
    }

    #[tokio::test]
    async fn switched_off_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.exec(&[KvOp::Incr { key: "k".into() }]).await.is_err());
        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        let store = MemoryStore::new();
        store.exec(&[KvOp::Incr { key: "k".into() }]).await.unwrap();
        assert!(store.set_members("k").await.is_err());
    }
}
