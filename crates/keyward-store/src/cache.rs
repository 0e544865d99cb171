//! Short-lived read cache backed by [`moka`].
//!
//! Providers read the same session row several times during one
//! authorization attempt. [`CacheLayer`] keeps the last read for a few
//! seconds; writers must call [`CacheLayer::invalidate`] for the key they
//! touched so a stale row is never served after a write.
//!
//! Every invalidation bumps an epoch. A load that started before the bump
//! returns its value to the caller but does not cache it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::trace;

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hits={} misses={}", self.hits(), self.misses())
    }
}

/// Concurrent TTL cache keyed by string.
///
/// Cloning is cheap and clones share entries and statistics.
pub struct CacheLayer<T> {
    name: &'static str,
    inner: Cache<String, T>,
    stats: Arc<CacheStats>,
    epoch: Arc<AtomicU64>,
}

impl<T> Clone for CacheLayer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<T> CacheLayer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn builder(name: &'static str) -> CacheLayerBuilder {
        CacheLayerBuilder {
            name,
            max_capacity: 1_000,
            ttl: Duration::from_secs(5),
        }
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let value = self.inner.get(key).await;
        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!(cache = self.name, key, "cache hit");
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            trace!(cache = self.name, key, "cache miss");
        }
        value
    }

    pub async fn insert(&self, key: &str, value: T) {
        self.inner.insert(key.to_string(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.invalidate(key).await;
        trace!(cache = self.name, key, "cache invalidate");
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.invalidate_all();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Return the cached value for `key`, or run `loader`, cache its
    /// result and return it. Loader errors are not cached, and neither is
    /// a result loaded across an invalidation.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let value = loader().await?;
        if self.epoch.load(Ordering::Acquire) != epoch {
            trace!(cache = self.name, key, "invalidated during load, not cached");
            return Ok(value);
        }
        self.insert(key, value.clone()).await;
        if self.epoch.load(Ordering::Acquire) != epoch {
            self.inner.invalidate(key).await;
        }
        Ok(value)
    }
}

pub struct CacheLayerBuilder {
    name: &'static str,
    max_capacity: u64,
    ttl: Duration,
}

impl CacheLayerBuilder {
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build<T>(self) -> CacheLayer<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        CacheLayer {
            name: self.name,
            inner: Cache::builder()
                .max_capacity(self.max_capacity)
                .time_to_live(self.ttl)
                .build(),
            stats: Arc::new(CacheStats::default()),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CacheLayer<Option<String>> {
        CacheLayer::<Option<String>>::builder("test")
            .ttl(Duration::from_secs(60))
            .build()
    }

    #[tokio::test]
    async fn insert_then_get() {
        let cache = cache();
        cache.insert("k", Some("v".to_string())).await;
        assert_eq!(cache.get("k").await, Some(Some("v".to_string())));
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn cached_none_is_a_hit() {
        let cache = cache();
        cache.insert("absent", None).await;
        assert_eq!(cache.get("absent").await, Some(None));
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = cache();
        cache.insert("k", Some("old".to_string())).await;
        cache.invalidate("k").await;

        let value = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>(Some("new".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("new"));
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache = cache();
        let failed = cache
            .get_or_try_insert_with("k", || async { Err::<Option<String>, _>("down") })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = cache();
        let other = cache.clone();
        cache.insert("k", Some("v".to_string())).await;
        other.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn load_racing_a_write_is_not_cached() {
        let cache = cache();
        let (loaded_tx, loaded_rx) = tokio::sync::oneshot::channel::<()>();
        let (written_tx, written_rx) = tokio::sync::oneshot::channel::<()>();

        let reader = async {
            cache
                .get_or_try_insert_with("k", || async {
                    // The row is read before the writer commits.
                    let old = Some("old".to_string());
                    let _ = loaded_tx.send(());
                    let _ = written_rx.await;
                    Ok::<_, ()>(old)
                })
                .await
                .unwrap()
        };
        let writer = async {
            let _ = loaded_rx.await;
            cache.invalidate_all();
            let _ = written_tx.send(());
        };
        let (read, ()) = tokio::join!(reader, writer);

        assert_eq!(read.as_deref(), Some("old"));
        assert_eq!(cache.get("k").await, None);

        let fresh = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>(Some("new".to_string())) })
            .await
            .unwrap();
        assert_eq!(fresh.as_deref(), Some("new"));
        assert_eq!(cache.get("k").await, Some(Some("new".to_string())));
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats::default();
        stats.hits.store(3, Ordering::Relaxed);
        assert_eq!(stats.to_string(), "hits=3 misses=0");
    }
}
