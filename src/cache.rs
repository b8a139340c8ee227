//! Cluster-replicated key cache.
//!
//! A token minted by server A must be verifiable on server B, so every
//! rotation publishes the new key under `"{server_id}:{slot}"`. The cache is
//! strictly best-effort: publish failures are logged and never fail a
//! rotation, and a miss simply means the foreign token cannot be verified
//! yet (reported upstream as a key-not-found decode failure).
//!
//! Backends:
//! - `MemorySharedCache` — in-process map, for tests and single-node runs.
//! - `RedisSharedCache` — feature `cache-redis`, pooled connections.

use crate::keys::SecretKeyData;
use crate::util::{Clock, SystemClock};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Build the cache key for a server's ring slot.
pub fn slot_cache_key(server_id: &str, slot: usize) -> String {
    format!("{server_id}:{slot}")
}

/// Injected capability for sharing verification keys across the cluster.
///
/// Entries are overwritten as slots recycle; there is no explicit deletion.
/// Implementations must treat `get` misses as ordinary.
pub trait SharedKeyCache: Send + Sync {
    /// Store `value` under `key` for at most `ttl_ms` milliseconds.
    fn put(&self, key: &str, value: &SecretKeyData, ttl_ms: u64) -> Result<()>;

    /// Fetch a previously published key, if still present.
    fn get(&self, key: &str) -> Result<Option<SecretKeyData>>;
}

/// In-memory backend honoring entry TTLs on read.
pub struct MemorySharedCache {
    entries: RwLock<HashMap<String, (u64, SecretKeyData)>>,
    clock: Arc<dyn Clock>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedKeyCache for MemorySharedCache {
    fn put(&self, key: &str, value: &SecretKeyData, ttl_ms: u64) -> Result<()> {
        let deadline = self.clock.now_millis().saturating_add(ttl_ms);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("shared key cache lock poisoned"))?;
        entries.insert(key.to_string(), (deadline, value.clone()));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<SecretKeyData>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("shared key cache lock poisoned"))?;
        Ok(entries.get(key).and_then(|(deadline, value)| {
            if self.clock.now_millis() < *deadline {
                Some(value.clone())
            } else {
                None
            }
        }))
    }
}

#[cfg(feature = "cache-redis")]
pub use redis_impl::RedisSharedCache;

#[cfg(feature = "cache-redis")]
mod redis_impl {
    use super::{Result, SecretKeyData, SharedKeyCache};
    use tracing::debug;

    const KEY_PREFIX: &str = "trustring:key:";

    struct RedisConnectionManager {
        client: redis::Client,
    }

    impl r2d2::ManageConnection for RedisConnectionManager {
        type Connection = redis::Connection;
        type Error = redis::RedisError;

        fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
            self.client.get_connection()
        }

        fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
            let _: String = redis::cmd("PING").query(conn)?;
            Ok(())
        }

        fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
            // Assume the connection is fine; r2d2 recycles on errors.
            false
        }
    }

    /// Redis-backed shared key cache, one entry per `(server, slot)`.
    pub struct RedisSharedCache {
        pool: r2d2::Pool<RedisConnectionManager>,
    }

    impl RedisSharedCache {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            let manager = RedisConnectionManager { client };
            let max_size = std::env::var("TRUSTRING_REDIS_POOL_SIZE")
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .unwrap_or(4);
            let pool = r2d2::Pool::builder().max_size(max_size).build(manager)?;
            debug!("redis shared key cache connected ({url})");
            Ok(Self { pool })
        }

        fn namespaced(key: &str) -> String {
            format!("{KEY_PREFIX}{key}")
        }
    }

    impl SharedKeyCache for RedisSharedCache {
        fn put(&self, key: &str, value: &SecretKeyData, ttl_ms: u64) -> Result<()> {
            let mut conn = self.pool.get()?;
            let payload = serde_json::to_string(value)?;
            let _: () = redis::cmd("SET")
                .arg(Self::namespaced(key))
                .arg(payload)
                .arg("PX")
                .arg(ttl_ms)
                .query(&mut *conn)?;
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<SecretKeyData>> {
            let mut conn = self.pool.get()?;
            let payload: Option<String> = redis::cmd("GET")
                .arg(Self::namespaced(key))
                .query(&mut *conn)?;
            match payload {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ExpiringSecretKey;
    use crate::util::ManualClock;

    fn sample_data(server_id: &str) -> SecretKeyData {
        ExpiringSecretKey::generate(60_000, server_id).to_data()
    }

    #[test]
    fn memory_cache_round_trips() {
        let cache = MemorySharedCache::new();
        let data = sample_data("server-a");
        cache.put(&slot_cache_key("server-a", 0), &data, 60_000).unwrap();
        let found = cache.get("server-a:0").unwrap().unwrap();
        assert_eq!(found, data);
        assert!(cache.get("server-a:1").unwrap().is_none());
    }

    #[test]
    fn memory_cache_expires_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemorySharedCache::with_clock(clock.clone());
        cache
            .put("server-a:0", &sample_data("server-a"), 1_000)
            .unwrap();
        clock.set(999);
        assert!(cache.get("server-a:0").unwrap().is_some());
        clock.set(1_000);
        assert!(cache.get("server-a:0").unwrap().is_none());
    }

    #[test]
    fn overwrites_recycled_slots() {
        let cache = MemorySharedCache::new();
        let first = sample_data("server-a");
        let second = sample_data("server-a");
        cache.put("server-a:0", &first, 60_000).unwrap();
        cache.put("server-a:0", &second, 60_000).unwrap();
        assert_eq!(cache.get("server-a:0").unwrap().unwrap(), second);
    }

    #[test]
    fn cache_key_format_is_stable() {
        // wire-compatibility contract with other cluster members
        assert_eq!(slot_cache_key("srv-17", 3), "srv-17:3");
    }
}
