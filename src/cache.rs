use async_trait::async_trait;
use redis::aio::ConnectionManager;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::TrapResult;
use crate::lock_utils::lock_or_recover;

/// Key prefix shared by every entry the trap writes
const KEY_PREFIX: &str = "stealthtrap";

/// Volatile key-value store with per-entry expiry.
///
/// Holds the fast-path ban flags, rate counters, challenge records, grace flags and
/// the geo cache. Nothing here is authoritative for bans; the durable log is.
#[async_trait]
pub trait TtlCache: Send + Sync {
    /// Get a value, `None` when absent or expired
    async fn get(&self, key: &str) -> TrapResult<Option<Vec<u8>>>;

    /// Set a value that expires after `ttl`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> TrapResult<()>;

    /// Delete a key (absent keys are not an error)
    async fn delete(&self, key: &str) -> TrapResult<()>;

    /// Atomically increment a counter. The first increment creates the counter
    /// with the given TTL; later increments keep the original expiry.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> TrapResult<u64>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> TrapResult<usize>;

    async fn exists(&self, key: &str) -> TrapResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Build a namespaced cache key, e.g. `stealthtrap:ban:203.0.113.7`
pub fn cache_key(kind: &str, ip: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, kind, ip)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process TTL cache for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones that expired but were not yet purged
    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, "memory cache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TtlCache for MemoryCache {
    async fn get(&self, key: &str) -> TrapResult<Option<Vec<u8>>> {
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> TrapResult<()> {
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> TrapResult<()> {
        lock_or_recover(&self.entries, "memory cache").remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> TrapResult<u64> {
        // Read, increment and write under one lock so concurrent requests never under-count
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        let now = Instant::now();

        let (count, expires_at) = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let current = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                (current + 1, entry.expires_at)
            }
            _ => (1, now + ttl),
        };

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: count.to_string().into_bytes(),
                expires_at,
            },
        );

        Ok(count)
    }

    async fn purge_expired(&self) -> TrapResult<usize> {
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();

        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        Ok(purged)
    }
}

/// TTL cache backed by DragonflyDB/Redis
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect to the given Redis URL
    pub async fn new(redis_url: &str) -> TrapResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

/// INCR and EXPIRE run server-side as one step. The window's expiry is set by the
/// request that opens it (fixed window), and a counter found without a TTL gets one.
static INCR_WITH_TTL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('TTL', KEYS[1]) == -1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#,
    )
});

/// Redis expiries are whole seconds; never round a short TTL down to "no expiry"
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl TtlCache for RedisCache {
    async fn get(&self, key: &str) -> TrapResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value = conn.get::<_, Option<Vec<u8>>>(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> TrapResult<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TrapResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> TrapResult<u64> {
        let mut conn = self.connection.clone();
        let count: u64 = INCR_WITH_TTL
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn purge_expired(&self) -> TrapResult<usize> {
        // Redis expires keys on its own
        Ok(0)
    }
}

/// Cache wrapper that logs and swallows errors on reads, for callers that prefer
/// a miss over a failure (the geo cache)
pub async fn get_or_none(cache: &dyn TtlCache, key: &str) -> Option<Vec<u8>> {
    match cache.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Cache GET error for key {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_generation() {
        assert_eq!(cache_key("ban", "203.0.113.7"), "stealthtrap:ban:203.0.113.7");
        assert_eq!(cache_key("rate", "2001:db8::1"), "stealthtrap:rate:2001:db8::1");
    }

    #[test]
    fn test_ttl_secs_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let cache = MemoryCache::new();

        cache.set("k", b"value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"value".to_vec()));
        assert!(cache.exists("k").await.unwrap());

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);

        // Deleting a missing key is fine
        cache.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_entry_expires() {
        let cache = MemoryCache::new();
        cache.set("short", b"1", Duration::from_millis(50)).await.unwrap();
        assert!(cache.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.exists("short").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_incr_keeps_window_expiry() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(100);

        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 2);

        // The window opened by the first increment closes on schedule
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_incr_is_atomic_across_tasks() {
        let cache = std::sync::Arc::new(MemoryCache::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    cache
                        .incr_with_ttl("shared", Duration::from_secs(60))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            cache.get("shared").await.unwrap(),
            Some(b"200".to_vec())
        );
    }

    #[tokio::test]
    async fn test_memory_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("a", b"1", Duration::from_millis(10)).await.unwrap();
        cache.set("b", b"1", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_incr_with_ttl() {
        let cache = RedisCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let key = cache_key("rate", "test-incr");
        cache.delete(&key).await.unwrap();

        assert_eq!(cache.incr_with_ttl(&key, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(cache.incr_with_ttl(&key, Duration::from_secs(60)).await.unwrap(), 2);

        cache.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_incr_restores_missing_ttl() {
        let cache = RedisCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let key = cache_key("rate", "test-incr-no-ttl");
        let mut conn = cache.connection.clone();
        let _: () = redis::cmd("SET").arg(&key).arg(5).query_async(&mut conn).await.unwrap();

        assert_eq!(cache.incr_with_ttl(&key, Duration::from_secs(60)).await.unwrap(), 6);
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "ttl was {}", ttl);

        cache.delete(&key).await.unwrap();
    }
}
