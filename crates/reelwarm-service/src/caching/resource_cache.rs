use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::ResourceCacheConfig;
use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::platform::{NativeRequest, ProgressFn, RequestToken};
use crate::prefetch::PrefetchTarget;
use crate::types::ResourceId;
use crate::utils::futures::CancelOnDrop;

use super::backoff::Backoff;
use super::{FetchError, FetchResult, ResourceRequest};

/// Counters describing the current state of a [`ResourceCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Native requests currently in flight.
    pub in_flight: usize,
    /// Items currently cached.
    pub cached: u64,
    /// Callers currently waiting on an in-flight request.
    pub waiters: usize,
}

/// A native request that is currently being processed.
struct InFlight {
    token: RequestToken,
    /// Distinguishes this request from earlier, cancelled requests for the same id.
    generation: u64,
    /// The task awaiting the native response.
    task: CancelOnDrop<()>,
}

struct Waiter<T> {
    key: u64,
    sender: oneshot::Sender<Option<T>>,
}

struct CacheState<T> {
    items: moka::sync::Cache<ResourceId, T>,
    in_flight: HashMap<ResourceId, InFlight>,
    /// Waiters per id, in registration order.
    waiters: HashMap<ResourceId, Vec<Waiter<T>>>,
    next_generation: u64,
    next_waiter: u64,
}

struct Inner<R: ResourceRequest> {
    request: R,
    sink: Arc<dyn EventSink>,
    backoff: Backoff,
    progress: ProgressFn,
    state: Mutex<CacheState<R::Item>>,
}

/// A bounded, single-flight cache of platform resources.
///
/// See the [module docs](super) for the semantics. All operations lock the cache state only
/// briefly and never across an `.await`.
///
/// Prefetching spawns tasks, so it must be called from within a Tokio runtime.
pub struct ResourceCache<R: ResourceRequest> {
    inner: Arc<Inner<R>>,
}

impl<R: ResourceRequest> Clone for ResourceCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ResourceRequest> fmt::Debug for ResourceCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_lock();
        let mut s = f.debug_struct("ResourceCache");
        s.field("name", &R::NAME);
        if let Ok(state) = state {
            s.field("in-flight requests", &state.in_flight.len())
                .field("cached items", &state.items.entry_count());
        }
        s.finish()
    }
}

impl<R: ResourceRequest> ResourceCache<R> {
    pub fn new(
        request: R,
        config: &ResourceCacheConfig,
        backoff_window: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let name = R::NAME;
        // The default TinyLFU policy may reject fresh entries once the cache is full.
        let items = moka::sync::Cache::builder()
            .max_capacity(config.capacity)
            .eviction_policy(moka::policy::EvictionPolicy::lru())
            .eviction_listener(move |id, _, cause| {
                tracing::trace!(cache = %name, resource = %id, ?cause, "Evicted cache entry")
            })
            .build();
        let progress: ProgressFn = Arc::new(move |id, fraction| {
            tracing::trace!(cache = %name, resource = %id, fraction, "Fetch progress")
        });

        Self {
            inner: Arc::new(Inner {
                request,
                sink,
                backoff: Backoff::new(name, backoff_window),
                progress,
                state: Mutex::new(CacheState {
                    items,
                    in_flight: HashMap::new(),
                    waiters: HashMap::new(),
                    next_generation: 0,
                    next_waiter: 0,
                }),
            }),
        }
    }

    /// Returns the cached item for `id`, or waits for the in-flight request of `id`.
    ///
    /// Misses right away if `id` is neither cached nor in flight. This never starts a native
    /// request, and returns within `timeout` even if the in-flight request keeps running.
    ///
    /// Items of a single-use cache are removed when they are handed out. Dropping the returned
    /// future withdraws only this caller from the waiters of `id`.
    pub async fn request_or_wait(&self, id: &ResourceId, timeout: Duration) -> Option<R::Item> {
        let name = R::NAME.as_str();
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut waiting = {
            let mut state = self.inner.lock();
            if let Some(item) = state.items.get(id) {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                if R::SINGLE_USE {
                    state.items.invalidate(id);
                }
                return Some(item);
            }
            if !state.in_flight.contains_key(id) {
                return None;
            }

            metric!(counter("caches.channel.hit") += 1, "cache" => name);
            let key = state.next_waiter;
            state.next_waiter += 1;
            let (sender, receiver) = oneshot::channel();
            state
                .waiters
                .entry(id.clone())
                .or_default()
                .push(Waiter { key, sender });

            Waiting {
                inner: &self.inner,
                id,
                key,
                receiver: Some(receiver),
            }
        };

        match waiting.wait(timeout).await {
            Ok(item) => item,
            Err(item) => {
                metric!(counter("caches.wait.timeout") += 1, "cache" => name);
                tracing::trace!(cache = name, resource = %id, "Timed out waiting for resource");
                item
            }
        }
    }

    /// Starts a native request for each id that is not cached, in flight, or backed off.
    pub fn prefetch(&self, ids: &[ResourceId]) {
        let name = R::NAME;
        let mut started = Vec::new();
        {
            let mut state = self.inner.lock();
            for id in ids {
                if state.items.contains_key(id) || state.in_flight.contains_key(id) {
                    continue;
                }
                if let Some(error) = self.inner.backoff.blocked_by(id) {
                    metric!(counter("caches.backoff") += 1, "cache" => name.as_str());
                    tracing::trace!(cache = %name, resource = %id, %error, "Skipping backed off resource");
                    continue;
                }

                let generation = state.next_generation;
                state.next_generation += 1;

                let NativeRequest { token, response } =
                    self.inner.request.start(id, Arc::clone(&self.inner.progress));
                let weak = Arc::downgrade(&self.inner);
                let task_id = id.clone();
                let task = tokio::spawn(async move {
                    let result = response.await;
                    if let Some(inner) = weak.upgrade() {
                        Inner::complete(&inner, &task_id, generation, result);
                    }
                });

                tracing::trace!(cache = %name, resource = %id, %token, "Started fetch");
                state.in_flight.insert(
                    id.clone(),
                    InFlight {
                        token,
                        generation,
                        task: CancelOnDrop::new(task),
                    },
                );
                started.push(id.clone());
            }
        }

        for id in started {
            self.inner.emit(EventKind::RequestStart, id);
        }
    }

    /// Cancels the in-flight requests of `ids`, resolves their waiters with `None` and drops
    /// their cached items.
    pub fn cancel(&self, ids: &[ResourceId]) {
        let mut cancelled = Vec::new();
        {
            let mut state = self.inner.lock();
            for id in ids {
                state.items.invalidate(id);
                for waiter in state.waiters.remove(id).into_iter().flatten() {
                    let _ = waiter.sender.send(None);
                }
                if let Some(flight) = state.in_flight.remove(id) {
                    cancelled.push((id.clone(), flight));
                }
            }
        }

        let name = R::NAME;
        for (id, flight) in cancelled {
            tracing::trace!(cache = %name, resource = %id, token = %flight.token, "Cancelled fetch");
            self.inner.request.cancel(flight.token);
            drop(flight.task);
            self.inner.emit(EventKind::Cancelled, id);
        }
    }

    /// Drops the cached items of `ids`, leaving in-flight requests alone.
    pub fn remove(&self, ids: &[ResourceId]) {
        let state = self.inner.lock();
        for id in ids {
            state.items.invalidate(id);
        }
    }

    /// Whether an item for `id` is cached. Does not consume single-use items.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.inner.lock().items.contains_key(id)
    }

    /// Whether a native request for `id` is in flight.
    pub fn is_in_flight(&self, id: &ResourceId) -> bool {
        self.inner.lock().in_flight.contains_key(id)
    }

    /// Whether prefetching currently skips `id` after a transient failure.
    pub fn is_backed_off(&self, id: &ResourceId) -> bool {
        self.inner.backoff.blocked_by(id).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        state.items.run_pending_tasks();
        CacheStats {
            in_flight: state.in_flight.len(),
            cached: state.items.entry_count(),
            waiters: state.waiters.values().map(Vec::len).sum(),
        }
    }
}

impl<R: ResourceRequest> Inner<R> {
    fn lock(&self) -> MutexGuard<'_, CacheState<R::Item>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: EventKind, id: ResourceId) {
        self.sink
            .emit(LifecycleEvent::new(kind, id, R::NAME.as_str()));
    }

    /// Records the outcome of a native request.
    ///
    /// Outcomes of requests that have since been cancelled are discarded.
    fn complete(self: &Arc<Self>, id: &ResourceId, generation: u64, result: FetchResult<R::Item>) {
        let name = R::NAME;
        let mut state = self.lock();
        if !state
            .in_flight
            .get(id)
            .is_some_and(|flight| flight.generation == generation)
        {
            tracing::trace!(cache = %name, resource = %id, "Discarding stale fetch result");
            return;
        }
        if let Some(flight) = state.in_flight.remove(id) {
            // We are running on this very task.
            flight.task.detach();
        }
        let waiters = state.waiters.remove(id).unwrap_or_default();

        let item = match result {
            Ok(item) => item,
            Err(error) => {
                metric!(counter("caches.fetch") += 1, "cache" => name.as_str(), "result" => error.metrics_tag());
                for waiter in waiters {
                    let _ = waiter.sender.send(None);
                }
                // The backoff must be in place before `prefetch` can see the id as idle again.
                let failed = self.classify_failure(id, error);
                drop(state);
                if failed {
                    self.emit(EventKind::Failed, id.clone());
                }
                return;
            }
        };

        metric!(counter("caches.fetch") += 1, "cache" => name.as_str(), "result" => "ok");
        self.backoff.clear(id);

        if R::SINGLE_USE {
            let mut item = Some(item);
            for waiter in waiters {
                match item.take() {
                    Some(value) => {
                        // The waiter went away in the meantime, try the next one.
                        if let Err(value) = waiter.sender.send(Some(value)) {
                            item = value;
                        }
                    }
                    None => {
                        let _ = waiter.sender.send(None);
                    }
                }
            }
            if let Some(item) = item {
                state.items.insert(id.clone(), item);
            }
        } else {
            for waiter in waiters {
                let _ = waiter.sender.send(Some(item.clone()));
            }
            state.items.insert(id.clone(), item);
        }
        drop(state);

        tracing::trace!(cache = %name, resource = %id, "Fetch completed");
        self.emit(EventKind::RequestEnd, id.clone());
    }

    /// Registers a backoff for transient failures. Returns whether the failure is reported.
    fn classify_failure(&self, id: &ResourceId, error: FetchError) -> bool {
        let name = R::NAME;
        match error {
            FetchError::Cancelled => {
                tracing::trace!(cache = %name, resource = %id, "Fetch was cancelled by the platform");
                false
            }
            ref error if error.is_transient() => {
                self.backoff.register_failure(name, id, error);
                false
            }
            error => {
                let dynerr: &dyn std::error::Error = &error; // tracing expects a `&dyn Error`
                tracing::warn!(cache = %name, resource = %id, error = dynerr, "Fetch failed");
                true
            }
        }
    }

    /// Takes the waiter `key` out of the waiters of `id`.
    ///
    /// Returns the item if it was delivered to that waiter in the meantime.
    fn withdraw_waiter(
        &self,
        id: &ResourceId,
        key: u64,
        receiver: &mut oneshot::Receiver<Option<R::Item>>,
    ) -> Option<R::Item> {
        let mut state = self.lock();
        if let Some(waiters) = state.waiters.get_mut(id) {
            waiters.retain(|waiter| waiter.key != key);
            if waiters.is_empty() {
                state.waiters.remove(id);
            }
        }
        // Nothing can be delivered to this waiter anymore, but something may already have been.
        receiver.try_recv().ok().flatten()
    }

    /// Puts back a single-use item that was delivered to a waiter which was gone by then.
    fn restore(&self, id: &ResourceId, item: R::Item) {
        if R::SINGLE_USE {
            self.lock().items.insert(id.clone(), item);
        }
    }
}

/// A registered waiter of a [`ResourceCache`].
///
/// Dropping it before it resolved withdraws the waiter.
struct Waiting<'a, R: ResourceRequest> {
    inner: &'a Arc<Inner<R>>,
    id: &'a ResourceId,
    key: u64,
    receiver: Option<oneshot::Receiver<Option<R::Item>>>,
}

impl<R: ResourceRequest> Waiting<'_, R> {
    /// Waits for the result, at most `timeout`.
    ///
    /// Returns `Err` on timeout, carrying an item that raced with the timeout.
    async fn wait(&mut self, timeout: Duration) -> Result<Option<R::Item>, Option<R::Item>> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        let result = tokio::time::timeout(timeout, &mut *receiver).await;
        let Some(mut receiver) = self.receiver.take() else {
            return Ok(None);
        };
        match result {
            // A dropped sender means the request was torn down without a result.
            Ok(item) => Ok(item.ok().flatten()),
            Err(_) => Err(self.inner.withdraw_waiter(self.id, self.key, &mut receiver)),
        }
    }
}

impl<R: ResourceRequest> Drop for Waiting<'_, R> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take()
            && let Some(item) = self.inner.withdraw_waiter(self.id, self.key, &mut receiver)
        {
            self.inner.restore(self.id, item);
        }
    }
}

impl<R: ResourceRequest> PrefetchTarget for ResourceCache<R> {
    fn prefetch(&self, ids: &[ResourceId]) {
        ResourceCache::prefetch(self, ids)
    }

    fn cancel(&self, ids: &[ResourceId]) {
        ResourceCache::cancel(self, ids)
    }

    fn contains(&self, id: &ResourceId) -> bool {
        ResourceCache::contains(self, id)
    }
}
