//! # Response caching
//!
//! Responses of the remote service are cached in memory, and concurrent requests for the same
//! key are coalesced into a single request. This module contains both layers:
//!
//! - The [`CacheStore`] is a bounded map with a time-to-live per entry. When it is full, the
//!   least recently accessed fifth of its entries is evicted at once.
//! - The [`Deduplicator`] sits in front of a store. On a miss it makes sure that only one request
//!   per key is in flight, and that every concurrent caller receives the outcome of that one
//!   request.
//!
//! A request goes through the following steps:
//! - First, the store is checked for a fresh value.
//! - On miss, a request that is already running for the same key is joined.
//! - Otherwise, a fresh request is started, optionally protected by a retry strategy.
//! - A successful result is written to the store. Failures are never cached, so the next caller
//!   tries again.
//!
//! ### Metrics
//!
//! Each of these metrics is tagged with a `cache` field that corresponds to the name of the store:
//!
//! - `caches.memory.hit`: Reads served by the store.
//! - `caches.memory.miss`: Reads not served by the store, including expired entries.
//! - `caches.memory.expired`: Entries dropped on read because their time-to-live has passed.
//! - `caches.memory.evicted`: Entries dropped to make room for new ones.
//! - `dedup.channel.hit`: Requests that joined a running request.
//! - `dedup.channel.miss`: Requests that started a new request.
//! - `dedup.computation`: Requests actually sent to the remote service.

mod dedup;
mod store;

pub use dedup::Deduplicator;
pub use store::{CacheStats, CacheStore};
