//! # Resource caches
//!
//! The pipeline keeps two in-memory caches of platform resources, both keyed by
//! [`ResourceId`](crate::types::ResourceId):
//!
//! - The coarse cache holds raw, reusable resources. An entry stays cached when it is handed out,
//!   and a playable item can be made from it any number of times.
//! - The ready-item cache holds playable items. A playable item can only be attached to a single
//!   engine, so an entry is removed from the cache when it is handed out.
//!
//! Both are instances of one [`ResourceCache`], parameterized by a [`ResourceRequest`] that
//! names the cache, says whether its items are single-use, and dispatches native requests.
//!
//! ## Single-flight
//!
//! At most one native request per id is in flight per cache. [`ResourceCache::prefetch`] is the
//! only operation that starts requests. [`ResourceCache::request_or_wait`] never starts one: it
//! returns a cached item, joins the in-flight request as a waiter, or misses right away.
//! Waiters are resolved in registration order when the request completes, and a waiter that
//! stops waiting (timeout or a dropped future) takes only itself out of the queue.
//!
//! ## Failures
//!
//! Caches never surface errors to their callers. A transient failure
//! ([`FetchError::Unavailable`]) puts the id into backoff, during which prefetching skips it.
//! Other failures are reported as a `Failed` lifecycle event. Either way the waiters get `None`.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field naming the cache:
//!
//! - `caches.access`: All `request_or_wait` calls.
//! - `caches.memory.hit`: Calls served from the cache.
//! - `caches.channel.hit`: Calls that joined an in-flight request.
//! - `caches.wait.timeout`: Waits that ran out of time.
//! - `caches.fetch`: Completed native requests, tagged with their `result`.
//! - `caches.backoff`: Prefetches skipped because of backoff.

mod backoff;
mod error;
mod requests;
mod resource_cache;


pub use error::{FetchError, FetchResult};
pub use requests::{CoarseResources, ReadyItems, ResourceRequest};
pub use resource_cache::{CacheStats, ResourceCache};

/// The caches of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheName {
    Coarse,
    Ready,
}

impl CacheName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coarse => "coarse_cache",
            Self::Ready => "ready_item_cache",
        }
    }
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for CacheName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
