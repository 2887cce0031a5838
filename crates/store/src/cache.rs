//! TTL read-through cache.
//!
//! Keys follow `<kind>:<id>` naming so pattern invalidation can stay a
//! plain prefix match. Synchronous operations take a `parking_lot`
//! mutex; the async get-or-set variant additionally serializes through
//! a tokio mutex that is released around the factory await, so a slow
//! factory never blocks plain reads.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ag_domain::Result;

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub size: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    invalidations: u64,
}

pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
    stats: Mutex<Counters>,
    async_lock: tokio::sync::Mutex<()>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(Counters::default()),
            async_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get a value if present, unexpired, and of the requested type.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            self.stats.lock().misses += 1;
            return None;
        };
        if entry.is_expired() {
            entries.remove(key);
            self.stats.lock().misses += 1;
            tracing::debug!(key, "cache expired");
            return None;
        }
        match entry.value.downcast_ref::<T>() {
            Some(value) => {
                self.stats.lock().hits += 1;
                Some(value.clone())
            }
            None => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T, ttl: Duration) {
        let entry = Entry {
            value: Arc::new(value),
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key.to_owned(), entry);
    }

    /// Remove one key. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.stats.lock().invalidations += 1;
        }
        removed
    }

    /// Remove every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().invalidations += removed as u64;
            tracing::debug!(prefix, removed, "cache prefix invalidated");
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        tracing::info!(count, "cache cleared");
    }

    /// Walk the table and delete expired entries. Called periodically
    /// by the background scheduler.
    pub fn cleanup_expired(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "cache cleanup removed expired entries");
        }
    }

    /// Get or compute synchronously.
    pub fn get_or_set<T, F>(&self, key: &str, ttl: Duration, factory: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(key) {
            return value;
        }
        let value = factory();
        self.set(key, value.clone(), ttl);
        value
    }

    /// Get or compute through an async factory. The async lock is
    /// released while the factory runs, then re-acquired to install.
    pub async fn get_or_set_async<T, F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let _guard = self.async_lock.lock().await;
            if let Some(value) = self.get::<T>(key) {
                return Ok(value);
            }
        }

        let value = factory().await?;

        {
            let _guard = self.async_lock.lock().await;
            self.set(key, value.clone(), ttl);
        }
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.stats.lock();
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            invalidations: counters.invalidations,
            size: self.entries.lock().len(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let total = stats.hits + stats.misses;
        let hit_rate = if total > 0 {
            stats.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{hit_rate:.1}%"),
            size = stats.size,
            invalidations = stats.invalidations,
            "cache stats"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn room_key(room_id: i64) -> String {
    format!("room_obj:{room_id}")
}

pub fn room_agents_key(room_id: i64) -> String {
    format!("room_agents:{room_id}")
}

pub fn room_messages_key(room_id: i64) -> String {
    format!("room_messages:{room_id}")
}

pub fn agent_key(agent_id: i64) -> String {
    format!("agent_obj:{agent_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cache = Cache::new();
        cache.set("k", 7_i64, Duration::from_secs(60));
        assert_eq!(cache.get::<i64>("k"), Some(7));
    }

    #[test]
    fn expired_entries_return_none() {
        let cache = Cache::new();
        cache.set("k", 7_i64, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get::<i64>("k"), None);
    }

    #[test]
    fn wrong_type_is_a_miss() {
        let cache = Cache::new();
        cache.set("k", 7_i64, Duration::from_secs(60));
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[test]
    fn invalidate_single_key() {
        let cache = Cache::new();
        cache.set("k", 1_i64, Duration::from_secs(60));
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert_eq!(cache.get::<i64>("k"), None);
    }

    #[test]
    fn prefix_invalidation_is_prefix_only() {
        let cache = Cache::new();
        cache.set(&room_messages_key(1), 1_i64, Duration::from_secs(60));
        cache.set(&room_messages_key(2), 2_i64, Duration::from_secs(60));
        cache.set(&agent_key(1), 3_i64, Duration::from_secs(60));

        cache.invalidate_prefix("room_messages:");
        assert_eq!(cache.get::<i64>(&room_messages_key(1)), None);
        assert_eq!(cache.get::<i64>(&room_messages_key(2)), None);
        assert_eq!(cache.get::<i64>(&agent_key(1)), Some(3));
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let cache = Cache::new();
        cache.set("dead", 1_i64, Duration::from_millis(1));
        cache.set("alive", 2_i64, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));

        cache.cleanup_expired();
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.get::<i64>("alive"), Some(2));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = Cache::new();
        cache.set("k", 1_i64, Duration::from_secs(60));
        let _ = cache.get::<i64>("k");
        let _ = cache.get::<i64>("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn get_or_set_computes_once() {
        let cache = Cache::new();
        let a = cache.get_or_set("k", Duration::from_secs(60), || 10_i64);
        let b = cache.get_or_set("k", Duration::from_secs(60), || 20_i64);
        assert_eq!(a, 10);
        assert_eq!(b, 10);
    }

    #[tokio::test]
    async fn get_or_set_async_installs_value() {
        let cache = Cache::new();
        let value = cache
            .get_or_set_async("k", Duration::from_secs(60), || async { Ok(5_i64) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(cache.get::<i64>("k"), Some(5));
    }

    #[tokio::test]
    async fn get_or_set_async_propagates_factory_error() {
        let cache = Cache::new();
        let result = cache
            .get_or_set_async::<i64, _, _>("k", Duration::from_secs(60), || async {
                Err(ag_domain::Error::Other("factory failed".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.get::<i64>("k"), None);
    }
}
