use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{self, BoxFuture};

use crate::caching::{CacheStore, Deduplicator};
use crate::error::Cancelled;
use crate::metrics::CollectorRef;
use crate::retry::{Classify, RetryHooks, RetryStrategy};

/// Fetches many values with a single request for everything that is not cached.
///
/// When built [with a deduplicator](Self::with_dedup), ids that are currently computed by it are
/// not requested again. The bulk load waits for those computations instead.
pub struct BulkLoader<K, V, E> {
    store: Arc<CacheStore<K, V>>,
    dedup: Option<Deduplicator<K, V, E>>,
    retry: Option<RetryStrategy>,
    collector: CollectorRef,
}

impl<K, V, E> Clone for BulkLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dedup: self.dedup.clone(),
            retry: self.retry.clone(),
            collector: self.collector.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for BulkLoader<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkLoader")
            .field("store", &self.store)
            .field("dedup", &self.dedup.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl<K, V, E> BulkLoader<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Classify + From<Cancelled> + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<K, V>>) -> Self {
        Self {
            store,
            dedup: None,
            retry: None,
            collector: None,
        }
    }

    /// Builds a loader on the store of `dedup` that joins its running computations.
    pub fn with_dedup(dedup: Deduplicator<K, V, E>) -> Self {
        let mut loader = Self::new(Arc::clone(dedup.store()));
        loader.dedup = Some(dedup);
        loader
    }

    /// Runs every bulk request through `retry`.
    pub fn with_retry(mut self, retry: impl Into<RetryStrategy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_collector(mut self, collector: CollectorRef) -> Self {
        self.collector = collector;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore<K, V>> {
        &self.store
    }

    /// Loads the values for `ids`.
    ///
    /// Fresh values are taken from the store, and ids with a running computation in the
    /// deduplicator wait for its outcome. All other distinct ids are passed to one call of
    /// `bulk_producer`, and every value it returns for a requested id is written to the store.
    /// Ids the producer has no value for are missing from the result.
    ///
    /// If the bulk request or a joined computation fails, its error is returned. Values of the
    /// bulk request are only cached if the bulk request succeeded.
    pub async fn load_many<I, F, Fut>(&self, ids: I, bulk_producer: F) -> Result<HashMap<K, V>, E>
    where
        I: IntoIterator<Item = K>,
        F: Fn(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>, E>>,
    {
        let mut found = HashMap::new();
        let mut joined = Vec::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.lookup(&id) {
                Lookup::Cached(value) => {
                    found.insert(id, value);
                }
                Lookup::Running(computation) => joined.push(async move {
                    let value = computation.await?;
                    Ok::<_, E>((id, value))
                }),
                Lookup::Missing => missing.push(id),
            }
        }

        metric!(counter("bulk.cached") += found.len() as i64);
        metric!(counter("bulk.joined") += joined.len() as i64);
        if missing.is_empty() && joined.is_empty() {
            return Ok(found);
        }

        tracing::trace!(
            cached = found.len(),
            joined = joined.len(),
            missing = missing.len(),
            "Loading batch of ids"
        );

        let request = async {
            if missing.is_empty() {
                return Ok(HashMap::new());
            }
            metric!(histogram("bulk.size") = missing.len() as u64);

            let request = || bulk_producer(missing.clone());
            match &self.retry {
                Some(retry) => {
                    let hooks = RetryHooks::new().collector(self.collector.clone());
                    retry.execute_with(request, &hooks).await
                }
                None => request().await,
            }
        };
        let (loaded, joined) = future::join(request, future::join_all(joined)).await;
        let loaded = loaded?;

        let requested: HashSet<_> = missing.into_iter().collect();
        for (id, value) in loaded {
            if !requested.contains(&id) {
                continue;
            }
            self.store.set(id.clone(), value.clone());
            found.insert(id, value);
        }

        for result in joined {
            let (id, value) = result?;
            found.insert(id, value);
        }

        Ok(found)
    }

    fn lookup(&self, id: &K) -> Lookup<V, E> {
        if let Some(value) = self.store.get(id) {
            return Lookup::Cached(value);
        }
        // the value may have been stored since, which `get_or_join` serves as well
        match self.dedup.as_ref().and_then(|dedup| dedup.get_or_join(id)) {
            Some(computation) => Lookup::Running(computation),
            None => Lookup::Missing,
        }
    }
}

/// Where the value of a single id comes from.
enum Lookup<V, E> {
    Cached(V),
    /// Computed right now by the deduplicator.
    Running(BoxFuture<'static, Result<V, E>>),
    Missing,
}
