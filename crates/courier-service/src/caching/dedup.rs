use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::error::Cancelled;
use crate::metrics::CollectorRef;
use crate::retry::{Classify, RetryHooks, RetryStrategy};

use super::CacheStore;

/// The shared result handle of a running computation.
type ComputationChannel<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

type PendingMap<K, T, E> = Arc<Mutex<HashMap<K, ComputationChannel<T, E>>>>;

fn lock_pending<K, T, E>(
    pending: &PendingMap<K, T, E>,
) -> MutexGuard<'_, HashMap<K, ComputationChannel<T, E>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deduplicates concurrent requests for the same key.
///
/// Results are served from the [`CacheStore`] when possible. On a miss, at most one computation
/// per key runs at any time. Every caller asking for the key while it runs waits for that
/// computation and receives a clone of its outcome, including its error. Only successful results
/// are written to the store.
///
/// Computations run as their own tokio task, so a caller dropping its future does not cancel the
/// computation for the other waiters.
pub struct Deduplicator<K, T, E> {
    store: Arc<CacheStore<K, T>>,

    /// Computations that are currently running, by key.
    pending: PendingMap<K, T, E>,

    /// Optional protection of every computation.
    retry: Option<RetryStrategy>,

    collector: CollectorRef,
}

impl<K, T, E> Clone for Deduplicator<K, T, E> {
    fn clone(&self) -> Self {
        Deduplicator {
            store: Arc::clone(&self.store),
            pending: Arc::clone(&self.pending),
            retry: self.retry.clone(),
            collector: self.collector.clone(),
        }
    }
}

impl<K, T, E> fmt::Debug for Deduplicator<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.try_lock().map(|p| p.len()).unwrap_or_default();
        f.debug_struct("Deduplicator")
            .field("store", &self.store)
            .field("running computations", &pending)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<K, T, E> Deduplicator<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Classify + From<Cancelled> + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<K, T>>) -> Self {
        Self {
            store,
            pending: Default::default(),
            retry: None,
            collector: None,
        }
    }

    /// Runs every computation through `retry`.
    pub fn with_retry(mut self, retry: impl Into<RetryStrategy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Reports the outcome of retried computations to `collector`.
    pub fn with_collector(mut self, collector: CollectorRef) -> Self {
        self.collector = collector;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore<K, T>> {
        &self.store
    }

    /// Returns the value for `key`, computing it with `producer` if needed.
    ///
    /// Successful results are cached with the store's default time-to-live.
    pub fn get_or_create<F, Fut>(&self, key: K, producer: F) -> BoxFuture<'static, Result<T, E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let ttl = self.store.default_ttl();
        self.get_or_create_with_ttl(key, producer, ttl)
    }

    /// Returns the value for `key`, computing it with `producer` if needed.
    ///
    /// The lookup, and the registration of a new computation, happen synchronously when this is
    /// called, not when the returned future is first polled. Two calls made back to back thus
    /// always share one computation.
    ///
    /// Must be called within a tokio runtime.
    pub fn get_or_create_with_ttl<F, Fut>(
        &self,
        key: K,
        producer: F,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<T, E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.store.name();
        let mut pending = lock_pending(&self.pending);

        if let Some(value) = self.store.get(&key) {
            return future::ready(Ok(value)).boxed();
        }

        if let Some(channel) = pending.get(&key) {
            // A concurrent request was deduplicated.
            metric!(counter("dedup.channel.hit") += 1, "cache" => name);
            return wait_for(channel.clone()).boxed();
        }

        metric!(counter("dedup.channel.miss") += 1, "cache" => name);

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        pending.insert(key.clone(), channel.clone());
        drop(pending);

        tracing::trace!(cache = name, ?key, "Spawning deduplicated computation");

        let registration = Registration {
            key: Some(key),
            pending: Arc::clone(&self.pending),
        };
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let collector = self.collector.clone();

        tokio::spawn(async move {
            metric!(counter("dedup.computation") += 1, "cache" => name);

            let result = match retry {
                Some(retry) => {
                    let hooks = RetryHooks::new().collector(collector);
                    retry.execute_with(producer, &hooks).await
                }
                None => producer().await,
            };

            registration.settle(&store, &result, ttl);
            // All waiters may be gone already, which is fine.
            sender.send(result).ok();
        });

        wait_for(channel).boxed()
    }

    /// Returns the cached value for `key`, or joins the computation running for it.
    ///
    /// Unlike [`get_or_create`](Self::get_or_create), this never starts a computation. Returns
    /// `None` if the key is neither cached nor being computed.
    pub fn get_or_join(&self, key: &K) -> Option<BoxFuture<'static, Result<T, E>>> {
        let pending = lock_pending(&self.pending);

        if let Some(value) = self.store.get(key) {
            return Some(future::ready(Ok(value)).boxed());
        }

        let channel = pending.get(key)?;
        metric!(counter("dedup.channel.hit") += 1, "cache" => self.store.name());
        Some(wait_for(channel.clone()).boxed())
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_pending(&self, key: &K) -> bool {
        lock_pending(&self.pending).contains_key(key)
    }

    /// The number of currently running computations.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Drops the cached value for `key`, so the next request computes it again.
    ///
    /// A computation that is currently running is not affected.
    pub fn invalidate(&self, key: &K) -> bool {
        self.store.delete(key)
    }
}

async fn wait_for<T, E>(channel: ComputationChannel<T, E>) -> Result<T, E>
where
    T: Clone,
    E: Clone + From<Cancelled>,
{
    match channel.await {
        Ok(result) => result,
        // The computation task was dropped or panicked before sending its result.
        Err(oneshot::Canceled) => Err(Cancelled.into()),
    }
}

/// The entry of a running computation in the pending map.
///
/// It is removed when the computation settles, or when the computation task is dropped without
/// settling.
struct Registration<K: Eq + Hash, T, E> {
    key: Option<K>,
    pending: PendingMap<K, T, E>,
}

impl<K: Eq + Hash, T, E> Registration<K, T, E> {
    /// Stores a successful result and removes the pending entry in one critical section.
    fn settle(mut self, store: &CacheStore<K, T>, result: &Result<T, E>, ttl: Duration)
    where
        K: Clone,
        T: Clone,
    {
        let Some(key) = self.key.take() else {
            return;
        };

        let mut pending = lock_pending(&self.pending);
        if let Ok(value) = result {
            store.set_with_ttl(key.clone(), value.clone(), ttl);
        }
        pending.remove(&key);
    }
}

impl<K: Eq + Hash, T, E> Drop for Registration<K, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock_pending(&self.pending).remove(&key);
        }
    }
}
