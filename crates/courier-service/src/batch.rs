//! Coalescing of individually requested operations into batches.
//!
//! Items added to a [`BatchCoalescer`] are queued until either the queue holds
//! [`max_batch_size`](BatchConfig::max_batch_size) items, or
//! [`batch_delay`](BatchConfig::batch_delay) has passed since the first item of the batch was
//! added. The whole queue is then drained in one step and every drained producer runs
//! concurrently.
//!
//! Unlike the [`Deduplicator`](crate::caching::Deduplicator), the items of a batch settle
//! independently: one failing producer never affects the outcome of its siblings.
//!
//! There is no backpressure. Items added faster than batches are flushed grow the queue without
//! bound.
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, join_all};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::BatchConfig;
use crate::error::Cancelled;

type Producer<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// A queued request.
struct BatchItem<K, T, E> {
    key: K,
    producer: Producer<T, E>,
    sender: oneshot::Sender<Result<T, E>>,
    enqueued_at: Instant,
}

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timer,
    Manual,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
        }
    }
}

/// The delay timer of the current batch.
struct ArmedTimer {
    /// Identifies this timer, so that a superseded timer can tell it no longer owns the batch.
    id: u64,
    handle: AbortHandle,
}

struct State<K, T, E> {
    queue: Vec<BatchItem<K, T, E>>,
    timer: Option<ArmedTimer>,
    next_timer_id: u64,
}

impl<K, T, E> State<K, T, E> {
    /// Disarms the timer and drains the queue.
    fn take_batch(&mut self) -> Vec<BatchItem<K, T, E>> {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
        mem::take(&mut self.queue)
    }
}

struct Inner<K, T, E> {
    config: BatchConfig,
    state: Mutex<State<K, T, E>>,
}

impl<K, T, E> Inner<K, T, E> {
    fn lock(&self) -> MutexGuard<'_, State<K, T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Groups requests arriving within a short window into batches.
///
/// Cloning yields another handle to the same queue.
pub struct BatchCoalescer<K, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

impl<K, T, E> Clone for BatchCoalescer<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T, E> fmt::Debug for BatchCoalescer<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_lock();
        f.debug_struct("BatchCoalescer")
            .field("config", &self.inner.config)
            .field("queued", &state.as_ref().map(|s| s.queue.len()).ok())
            .field("timer armed", &state.as_ref().map(|s| s.timer.is_some()).ok())
            .finish()
    }
}

impl<K, T, E> BatchCoalescer<K, T, E>
where
    K: fmt::Debug + Send + 'static,
    T: Send + 'static,
    E: From<Cancelled> + Send + 'static,
{
    /// Creates a coalescer. A `max_batch_size` of zero is treated as one.
    pub fn new(config: &BatchConfig) -> Self {
        let config = BatchConfig {
            max_batch_size: config.max_batch_size.max(1),
            ..*config
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    timer: None,
                    next_timer_id: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queues `producer` and returns its eventual outcome.
    ///
    /// The item is queued when this is called. If it fills the batch, the batch is flushed right
    /// away. Otherwise the delay timer is armed, unless it already is.
    ///
    /// Must be called within a tokio runtime. If the item is [cleared](Self::clear) before it was
    /// flushed, the returned future resolves to [`Cancelled`].
    pub fn add<F, Fut>(&self, key: K, producer: F) -> BoxFuture<'static, Result<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let item = BatchItem {
            key,
            producer: Box::new(move || producer().boxed()),
            sender,
            enqueued_at: Instant::now(),
        };

        let mut state = self.inner.lock();
        state.queue.push(item);

        if state.queue.len() >= self.inner.config.max_batch_size {
            let batch = state.take_batch();
            drop(state);
            tokio::spawn(run_batch(batch, FlushTrigger::Size));
        } else if state.timer.is_none() {
            self.arm_timer(&mut state);
        }

        async move {
            match receiver.await {
                Ok(result) => result,
                Err(oneshot::Canceled) => Err(Cancelled.into()),
            }
        }
        .boxed()
    }

    fn arm_timer(&self, state: &mut State<K, T, E>) {
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let delay = self.inner.config.batch_delay;
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let batch = {
                let mut state = inner.lock();
                if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
                    tracing::trace!(timer = id, "Ignoring superseded batch timer");
                    return;
                }
                state.timer = None;
                state.take_batch()
            };

            run_batch(batch, FlushTrigger::Timer).await;
        });

        state.timer = Some(ArmedTimer {
            id,
            handle: task.abort_handle(),
        });
    }

    /// Flushes the current batch now and waits until all of its items settled.
    ///
    /// Items added while the flush runs belong to the next batch. Returns the number of flushed
    /// items.
    pub async fn flush(&self) -> usize {
        let batch = self.inner.lock().take_batch();
        run_batch(batch, FlushTrigger::Manual).await
    }

    /// Rejects all queued items with [`Cancelled`] and disarms the timer.
    ///
    /// Returns the number of rejected items. Items of a batch that is already running are not
    /// affected.
    pub fn clear(&self) -> usize {
        let batch = self.inner.lock().take_batch();
        let count = batch.len();

        for item in batch {
            item.sender.send(Err(Cancelled.into())).ok();
        }

        if count > 0 {
            tracing::debug!(count, "Cleared queued batch items");
        }
        count
    }

    /// The number of items waiting for the next flush.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the delay timer of the current batch is running.
    pub fn has_armed_timer(&self) -> bool {
        self.inner.lock().timer.is_some()
    }
}

/// Runs every producer of `batch` concurrently and settles each item on its own.
async fn run_batch<K, T, E>(batch: Vec<BatchItem<K, T, E>>, trigger: FlushTrigger) -> usize
where
    K: fmt::Debug,
{
    let size = batch.len();
    if size == 0 {
        return 0;
    }

    metric!(counter("batch.flush") += 1, "trigger" => trigger.as_str());
    metric!(histogram("batch.size") = size as u64);
    tracing::debug!(size, trigger = trigger.as_str(), "Flushing batch");

    let settles = batch.into_iter().map(|item| async move {
        let BatchItem {
            key,
            producer,
            sender,
            enqueued_at,
        } = item;
        metric!(timer("batch.item.wait") = enqueued_at.elapsed());

        // A panicking producer drops its sender, which its caller sees as a cancellation.
        let Ok(result) = AssertUnwindSafe(producer()).catch_unwind().await else {
            tracing::error!(?key, "Batch item producer panicked");
            return;
        };

        if result.is_err() {
            metric!(counter("batch.item.failed") += 1);
            tracing::trace!(?key, "Batch item failed");
        }
        sender.send(result).ok();
    });
    join_all(settles).await;

    size
}
