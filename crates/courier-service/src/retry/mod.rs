//! # Retry engine
//!
//! Re-executes failed operations with exponential backoff and jitter.
//!
//! Every failure is [classified](classify()) into an [`ErrorKind`]. Only kinds that are
//! retryable (network, timeout and server failures) are ever retried, and a caller supplied
//! predicate can veto any retry. When the engine gives up, the caller gets the *original* error of
//! the last attempt, never a wrapper, so it can still match on what actually went wrong.
//!
//! There are two strategies:
//!
//! - [`RetryPolicy`] commits to one retry budget up front.
//! - [`SmartRetry`] runs the first attempt without any budget. Only when it fails, the failure is
//!   classified and the [`RetryPolicy`] configured for that kind of failure is used for the
//!   remaining attempts of that call. The same operation can thus get different budgets
//!   depending on how it failed first.
//!
//! Errors can demand a minimum delay through [`Classify::retry_after`], which overrides both the
//! backoff and its cap. Delays are awaited in full. The only way to abort a pending retry is to drop the future.
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::metrics::{CollectorRef, report};

mod backoff;
mod classify;

pub use backoff::{JITTER_RANGE, compute_delay};
pub use classify::{Classification, Classify, ErrorKind, classify};

/// The budget and backoff curve for retrying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How often to retry after the first attempt failed.
    pub max_retries: u32,
    /// The delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Factor the delay grows by with each retry.
    #[serde(alias = "backoff")]
    pub multiplier: f64,
    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NEVER: RetryPolicy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
        multiplier: 1.0,
        max_delay: Duration::ZERO,
    };

    /// The delay before retry number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_delay(attempt, self.delay, self.multiplier, self.max_delay)
    }

    /// Runs `operation`, retrying according to this policy.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.execute_with(operation, &RetryHooks::default()).await
    }

    /// Runs `operation`, retrying according to this policy and reporting to `hooks`.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: F,
        hooks: &RetryHooks<'_, E>,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let start = Instant::now();
        let first = operation().await;
        let result = retry_loop(self, &operation, hooks, first).await;
        hooks.report_outcome(&result, start.elapsed());
        result
    }
}

/// Per-call details handed to [`RetryHooks::on_retry`].
#[derive(Debug)]
pub struct RetryContext<'e, E> {
    /// The attempt that just failed, starting at 1.
    pub attempt: u32,
    /// The error of the failed attempt.
    pub last_error: &'e E,
    pub classification: Classification,
    /// How long the engine will wait before the next attempt.
    pub delay: Duration,
}

type Predicate<'a, E> = Box<dyn Fn(&E, u32) -> bool + Send + Sync + 'a>;
type Observer<'a, E> = Box<dyn Fn(&RetryContext<'_, E>) + Send + Sync + 'a>;

/// Optional callbacks that customize a single execution.
pub struct RetryHooks<'a, E> {
    should_retry: Option<Predicate<'a, E>>,
    on_retry: Option<Observer<'a, E>>,
    collector: CollectorRef,
}

impl<E> Default for RetryHooks<'_, E> {
    fn default() -> Self {
        Self {
            should_retry: None,
            on_retry: None,
            collector: None,
        }
    }
}

impl<E> std::fmt::Debug for RetryHooks<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHooks")
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("collector", &self.collector)
            .finish()
    }
}

impl<'a, E> RetryHooks<'a, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate that can veto retrying an otherwise retryable error.
    ///
    /// It receives the error and the number of the attempt that produced it.
    pub fn should_retry(mut self, f: impl Fn(&E, u32) -> bool + Send + Sync + 'a) -> Self {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Adds an observer invoked right before the engine waits for the next attempt.
    ///
    /// Panics in the observer are caught and logged.
    pub fn on_retry(mut self, f: impl Fn(&RetryContext<'_, E>) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Reports the outcome of every execution to `collector`.
    pub fn collector(mut self, collector: CollectorRef) -> Self {
        self.collector = collector;
        self
    }

    fn vetoes(&self, error: &E, attempt: u32) -> bool {
        self.should_retry
            .as_ref()
            .is_some_and(|should_retry| !should_retry(error, attempt))
    }

    fn notify(&self, context: &RetryContext<'_, E>) {
        let Some(on_retry) = &self.on_retry else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| on_retry(context))).is_err() {
            tracing::warn!(attempt = context.attempt, "on_retry hook panicked");
        }
    }

    fn report_outcome<T>(&self, result: &Result<T, E>, elapsed: Duration)
    where
        E: Classify,
    {
        report(&self.collector, |collector| {
            match result {
                Ok(_) => collector.record_success(),
                Err(error) => collector.record_failure(error.kind()),
            }
            collector.record_response_time(elapsed);
        });
    }
}

/// Drives the remaining attempts after the first one produced `result`.
async fn retry_loop<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &F,
    hooks: &RetryHooks<'_, E>,
    mut result: Result<T, E>,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    let mut attempt = 1;
    loop {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let classification = classify(&error);
        if attempt > policy.max_retries
            || !classification.retryable
            || hooks.vetoes(&error, attempt)
        {
            tracing::debug!(
                attempt,
                kind = %classification.kind,
                retryable = classification.retryable,
                "Giving up on operation"
            );
            return Err(error);
        }

        let mut delay = policy.delay_for(attempt);
        if let Some(retry_after) = error.retry_after() {
            delay = delay.max(retry_after);
        }
        hooks.notify(&RetryContext {
            attempt,
            last_error: &error,
            classification,
            delay,
        });
        metric!(counter("retry.attempt") += 1, "kind" => classification.kind.as_str());
        tracing::trace!(attempt, kind = %classification.kind, ?delay, "Retrying operation");

        drop(error);
        tokio::time::sleep(delay).await;

        attempt += 1;
        result = operation().await;
    }
}

/// Per-kind retry policies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RetryProfiles(BTreeMap<ErrorKind, RetryPolicy>);

impl RetryProfiles {
    pub fn new(profiles: impl IntoIterator<Item = (ErrorKind, RetryPolicy)>) -> Self {
        Self(profiles.into_iter().collect())
    }

    /// The policy for `kind`. Kinds without a profile are never retried.
    pub fn get(&self, kind: ErrorKind) -> RetryPolicy {
        self.0.get(&kind).copied().unwrap_or(RetryPolicy::NEVER)
    }

    /// All configured profiles, ordered by kind.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorKind, &RetryPolicy)> {
        self.0.iter().map(|(kind, policy)| (*kind, policy))
    }
}

impl Default for RetryProfiles {
    fn default() -> Self {
        Self::new([
            (
                ErrorKind::Network,
                RetryPolicy {
                    max_retries: 3,
                    delay: Duration::from_secs(1),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(10),
                },
            ),
            (
                ErrorKind::Timeout,
                RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_secs(2),
                    multiplier: 1.5,
                    max_delay: Duration::from_secs(10),
                },
            ),
            (
                ErrorKind::Server,
                RetryPolicy {
                    max_retries: 3,
                    delay: Duration::from_secs(2),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(30),
                },
            ),
        ])
    }
}

/// Picks the retry budget based on how the first attempt failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartRetry {
    profiles: RetryProfiles,
}

impl SmartRetry {
    pub fn new(profiles: RetryProfiles) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &RetryProfiles {
        &self.profiles
    }

    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.execute_with(operation, &RetryHooks::default()).await
    }

    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: F,
        hooks: &RetryHooks<'_, E>,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let start = Instant::now();
        let result = match operation().await {
            Ok(value) => Ok(value),
            Err(error) => {
                let policy = self.profiles.get(error.kind());
                retry_loop(&policy, &operation, hooks, Err(error)).await
            }
        };
        hooks.report_outcome(&result, start.elapsed());
        result
    }
}

/// Either of the retry strategies, for components that can be configured with one.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    Fixed(RetryPolicy),
    Smart(SmartRetry),
}

impl RetryStrategy {
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: F,
        hooks: &RetryHooks<'_, E>,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        match self {
            RetryStrategy::Fixed(policy) => policy.execute_with(operation, hooks).await,
            RetryStrategy::Smart(smart) => smart.execute_with(operation, hooks).await,
        }
    }
}

impl From<RetryPolicy> for RetryStrategy {
    fn from(policy: RetryPolicy) -> Self {
        Self::Fixed(policy)
    }
}

impl From<SmartRetry> for RetryStrategy {
    fn from(smart: SmartRetry) -> Self {
        Self::Smart(smart)
    }
}
