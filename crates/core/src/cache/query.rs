use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::trace;

use super::Clock;
use crate::engine::EngineError;
use crate::metrics::CACHE_LOOKUPS;

/// Default time a cached answer stays valid.
pub const CACHED_DATA_EXPIRATION: Duration = Duration::from_secs(1);

/// The wrapped query. Called with the key on every cache miss.
pub type Fetcher<K, V> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, EngineError>> + Send + Sync>;

/// A fetched value and the instant it was fetched.
#[derive(Debug, Clone)]
pub struct CachedValue<V> {
    value: V,
    fetched_at: Instant,
}

impl<V> CachedValue<V> {
    pub fn new(value: V, fetched_at: Instant) -> Self {
        Self { value, fetched_at }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Whether the value is still within `ttl` of `now`.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) <= ttl
    }
}

/// Memoizes one kind of engine query per key.
///
/// Entries are created on first access and only dropped through `invalidate`.
/// Failed fetches are never stored.
pub struct CachedQuery<K, V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    fetch: Fetcher<K, V>,
    entries: RwLock<HashMap<K, CachedValue<V>>>,
}

impl<K, V> CachedQuery<K, V>
where
    K: Copy + Eq + Hash + Send + Sync + std::fmt::Debug,
    V: Clone + Send + Sync,
{
    /// Create a cache named `name` (used as a metrics label).
    pub fn new(
        name: &'static str,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        fetch: Fetcher<K, V>,
    ) -> Self {
        Self {
            name,
            ttl,
            clock,
            fetch,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the value for `key`.
    ///
    /// With `fresh == false` a value fetched within the TTL is returned as is.
    /// Otherwise the fetcher runs and its result replaces the cached entry.
    pub async fn get(&self, key: K, fresh: bool) -> Result<V, EngineError> {
        let now = self.clock.now();

        if !fresh {
            if let Some(cached) = self.entries.read().await.get(&key) {
                if cached.is_fresh(now, self.ttl) {
                    CACHE_LOOKUPS.with_label_values(&[self.name, "hit"]).inc();
                    return Ok(cached.value.clone());
                }
            }
        }

        CACHE_LOOKUPS.with_label_values(&[self.name, "miss"]).inc();
        trace!(cache = self.name, key = ?key, fresh, "Fetching");

        // The lock is not held while the fetch runs.
        let value = (self.fetch)(key).await?;
        self.entries
            .write()
            .await
            .insert(key, CachedValue::new(value.clone(), now));

        Ok(value)
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Number of keys with a cached value.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_query(
        clock: Arc<ManualClock>,
        calls: Arc<AtomicUsize>,
    ) -> CachedQuery<u64, u64> {
        let fetch: Fetcher<u64, u64> = Arc::new(move |key| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                Ok(key * 100 + n)
            }
            .boxed()
        });
        CachedQuery::new("test", CACHED_DATA_EXPIRATION, clock, fetch)
    }

    #[tokio::test]
    async fn test_cached_read_within_ttl_fetches_once() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(Arc::clone(&clock), Arc::clone(&calls));

        let first = query.get(1, false).await.unwrap();
        clock.advance(Duration::from_millis(500));
        let second = query.get(1, false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_value_at_exact_ttl_is_still_fresh() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(Arc::clone(&clock), Arc::clone(&calls));

        query.get(1, false).await.unwrap();
        clock.advance(CACHED_DATA_EXPIRATION);
        query.get(1, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(1));
        query.get(1, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fresh_read_always_fetches() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(Arc::clone(&clock), Arc::clone(&calls));

        query.get(1, true).await.unwrap();
        query.get(1, true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // A fresh read refreshes the entry for later cached reads.
        let refreshed = query.get(1, true).await.unwrap();
        assert_eq!(query.get(1, false).await.unwrap(), refreshed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_keys_are_cached_independently() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(clock, Arc::clone(&calls));

        query.get(1, false).await.unwrap();
        query.get(2, false).await.unwrap();
        query.get(1, false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(query.len().await, 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch: Fetcher<u64, u64> = Arc::new(move |key| {
            let calls = Arc::clone(&counter);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EngineError::Unavailable("busy".into()))
                } else {
                    Ok(key)
                }
            }
            .boxed()
        });
        let query = CachedQuery::new("flaky", CACHED_DATA_EXPIRATION, clock, fetch);

        assert!(query.get(9, false).await.is_err());
        assert!(query.is_empty().await);
        assert_eq!(query.get(9, false).await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(clock, Arc::clone(&calls));

        query.get(4, false).await.unwrap();
        assert!(query.invalidate(&4).await);
        assert!(!query.invalidate(&4).await);
        query.get(4, false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
