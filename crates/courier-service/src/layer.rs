use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::batch::BatchCoalescer;
use crate::bulk::BulkLoader;
use crate::caching::{CacheStore, Deduplicator};
use crate::clock::{ClockRef, tokio_clock};
use crate::config::Config;
use crate::error::Cancelled;
use crate::metrics::CollectorRef;
use crate::retry::{Classify, RetryHooks, RetryStrategy};

/// The resilience layer in front of one kind of remote resource.
///
/// The deduplicator and the bulk loader share one [`CacheStore`], so values fetched by either are
/// served to both. The bulk loader also waits for computations the deduplicator is running
/// instead of requesting those ids again. The batch coalescer does not cache.
pub struct Layer<K, V, E> {
    store: Arc<CacheStore<K, V>>,
    dedup: Deduplicator<K, V, E>,
    batch: BatchCoalescer<K, V, E>,
    bulk: BulkLoader<K, V, E>,
    retry: RetryStrategy,
    collector: CollectorRef,
}

impl<K, V, E> Clone for Layer<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dedup: self.dedup.clone(),
            batch: self.batch.clone(),
            bulk: self.bulk.clone(),
            retry: self.retry.clone(),
            collector: self.collector.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for Layer<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("dedup", &self.dedup)
            .field("batch", &self.batch)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<K, V, E> Layer<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Classify + From<Cancelled> + Clone + Send + Sync + 'static,
{
    /// Builds all components from `config`.
    ///
    /// `name` tags the metrics of the cache.
    pub fn new(name: &'static str, config: &Config) -> Self {
        Self::with_clock(name, config, tokio_clock(), None)
    }

    pub fn with_clock(
        name: &'static str,
        config: &Config,
        clock: ClockRef,
        collector: CollectorRef,
    ) -> Self {
        let store = Arc::new(CacheStore::new(name, &config.cache, clock));
        let retry = config.retry.strategy();

        let dedup = Deduplicator::new(Arc::clone(&store))
            .with_retry(retry.clone())
            .with_collector(collector.clone());
        let bulk = BulkLoader::with_dedup(dedup.clone())
            .with_retry(retry.clone())
            .with_collector(collector.clone());
        let batch = BatchCoalescer::new(&config.batch);

        tracing::debug!(
            cache = name,
            max_size = config.cache.max_size,
            ttl = ?config.cache.ttl,
            "Created resilience layer"
        );

        Self {
            store,
            dedup,
            batch,
            bulk,
            retry,
            collector,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<K, V>> {
        &self.store
    }

    pub fn dedup(&self) -> &Deduplicator<K, V, E> {
        &self.dedup
    }

    pub fn batch(&self) -> &BatchCoalescer<K, V, E> {
        &self.batch
    }

    pub fn bulk(&self) -> &BulkLoader<K, V, E> {
        &self.bulk
    }

    pub fn retry(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Fetches a single value through the cache and the deduplicator.
    pub fn get<F, Fut>(&self, key: K, producer: F) -> BoxFuture<'static, Result<V, E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.dedup.get_or_create(key, producer)
    }

    /// Runs an uncached operation with the configured retry strategy.
    ///
    /// Use this for requests that change state on the remote.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let hooks = RetryHooks::new().collector(self.collector.clone());
        self.retry.execute_with(operation, &hooks).await
    }
}
