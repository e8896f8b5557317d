//! Client-side request cache.
//!
//! This module provides the `RequestCache` that decides when server data is
//! fetched, deduplicates concurrent requests for the same key, and drops or
//! refetches entries when the tags they were provided under are invalidated.
//!
//! Entries are kept in memory only. Nothing in here is persisted; every
//! process start rebuilds the cache from the network.

pub mod entry;
pub mod key;
pub mod manager;
pub mod tags;

pub use entry::{EntrySnapshot, Outcome, Payload, Query, QueryStatus};
pub use key::CacheKey;
pub use manager::{CacheConfig, RequestCache, WeakRequestCache};
pub use tags::{Tag, TagId, TagIndex};
