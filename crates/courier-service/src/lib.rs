//! A client-side resilience layer for calls to a slow or flaky remote service.
//!
//! The [`Layer`](layer::Layer) bundles the building blocks, which can also be used on their own:
//!
//! - [`CacheStore`](caching::CacheStore): a bounded in-memory cache with time-to-live expiry and
//!   least-recently-used eviction.
//! - [`Deduplicator`](caching::Deduplicator): runs at most one request per key at a time and
//!   shares its outcome with every concurrent caller.
//! - [`BatchCoalescer`](batch::BatchCoalescer): groups requests arriving within a short window.
//! - [`BulkLoader`](bulk::BulkLoader): fetches everything that is not cached in one request.
//! - [`retry`]: classifies failures and retries them with exponential backoff and jitter.

#[macro_use]
pub mod metrics;

pub mod batch;
pub mod bulk;
pub mod caching;
pub mod clock;
pub mod config;
pub mod error;
pub mod layer;
pub mod logging;
pub mod retry;
