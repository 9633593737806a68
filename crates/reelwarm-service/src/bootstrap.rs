//! The last-resort load path: full-fidelity fetches of a single resource.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use crate::boot::{BootPhase, BootPhaseGate};
use crate::caching::FetchError;
use crate::events::{EventKind, EventSink, LifecycleEvent, LoadPath};
use crate::platform::{MediaPlatform, NativeRequest, RequestToken};
use crate::types::{PlayableItem, QualityOptions, ResourceId};
use crate::utils::futures::CancelOnDrop;

const ORIGIN: &str = "bootstrapper";

type BootstrapChannel = Shared<BoxFuture<'static, Option<PlayableItem>>>;

struct Tracked {
    generation: u64,
    /// The native request, once it has been dispatched.
    token: Option<RequestToken>,
    result: BootstrapChannel,
    task: CancelOnDrop<()>,
}

#[derive(Default)]
struct BootstrapState {
    tasks: HashMap<ResourceId, Tracked>,
    next_generation: u64,
}

struct Inner {
    platform: Arc<dyn MediaPlatform>,
    gate: Arc<BootPhaseGate>,
    sink: Arc<dyn EventSink>,
    foreground_wait: Duration,
    state: Mutex<BootstrapState>,
}

/// Deduplicated "make sure a full-fidelity fetch is running" tasks, one per resource.
///
/// A task first waits for the app to become foreground-active (bounded by `foreground_wait`),
/// then requests a ready item with [`QualityOptions::FULL_FIDELITY`] and no timeout. Tasks are
/// forgotten once they finish, so a later call starts afresh.
#[derive(Clone)]
pub struct Bootstrapper {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = self
            .inner
            .state
            .try_lock()
            .map(|state| state.tasks.len())
            .unwrap_or_default();
        f.debug_struct("Bootstrapper")
            .field("foreground_wait", &self.inner.foreground_wait)
            .field("tracked", &tracked)
            .finish()
    }
}

impl Bootstrapper {
    pub fn new(
        platform: Arc<dyn MediaPlatform>,
        gate: Arc<BootPhaseGate>,
        sink: Arc<dyn EventSink>,
        foreground_wait: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                gate,
                sink,
                foreground_wait,
                state: Mutex::default(),
            }),
        }
    }

    /// Starts the task for `id`, unless one is already running.
    pub fn ensure_started(&self, id: &ResourceId) {
        let mut state = self.inner.lock();
        if !state.tasks.contains_key(id) {
            let _channel = Inner::spawn(&self.inner, &mut state, id);
        }
    }

    /// Waits for the result of the task for `id`, starting it if needed.
    ///
    /// Concurrent callers share one task and all receive its result.
    pub async fn await_result(&self, id: &ResourceId) -> Option<PlayableItem> {
        let channel = {
            let mut state = self.inner.lock();
            match state.tasks.get(id) {
                Some(tracked) => tracked.result.clone(),
                None => Inner::spawn(&self.inner, &mut state, id),
            }
        };
        channel.await
    }

    /// Aborts the task for `id` and cancels its native request.
    pub fn cancel(&self, id: &ResourceId) {
        let Some(tracked) = self.inner.lock().tasks.remove(id) else {
            return;
        };
        drop(tracked.task);
        if let Some(token) = tracked.token {
            self.inner.platform.cancel_request(token);
        }
        tracing::debug!(resource = %id, "Cancelled bootstrap");
        self.inner.sink.emit(
            LifecycleEvent::new(EventKind::Cancelled, id.clone(), ORIGIN)
                .with_path(Some(LoadPath::DirectFetch)),
        );
    }

    pub fn is_tracked(&self, id: &ResourceId) -> bool {
        self.inner.lock().tasks.contains_key(id)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BootstrapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(
        self: &Arc<Self>,
        state: &mut BootstrapState,
        id: &ResourceId,
    ) -> BootstrapChannel {
        let generation = state.next_generation;
        state.next_generation += 1;

        let (sender, receiver) = oneshot::channel();
        let result = receiver.map(|item| item.ok().flatten()).boxed().shared();

        let task = tokio::spawn(Self::bootstrap(
            Arc::downgrade(self),
            id.clone(),
            generation,
            sender,
        ));

        state.tasks.insert(
            id.clone(),
            Tracked {
                generation,
                token: None,
                result: result.clone(),
                task: CancelOnDrop::new(task),
            },
        );
        result
    }

    async fn bootstrap(
        inner: Weak<Self>,
        id: ResourceId,
        generation: u64,
        sender: oneshot::Sender<Option<PlayableItem>>,
    ) {
        let Some(this) = inner.upgrade() else {
            return;
        };
        let (gate, sink, foreground_wait) = (
            Arc::clone(&this.gate),
            Arc::clone(&this.sink),
            this.foreground_wait,
        );
        drop(this);

        if !gate
            .wait_until(BootPhase::AppForegroundActive, foreground_wait)
            .await
        {
            tracing::debug!(resource = %id, "App did not become active, bootstrapping anyway");
        }

        let Some(request) = inner
            .upgrade()
            .and_then(|this| this.dispatch(&id, generation))
        else {
            return;
        };
        sink.emit(
            LifecycleEvent::new(EventKind::RequestStart, id.clone(), ORIGIN)
                .with_path(Some(LoadPath::DirectFetch)),
        );

        let item = match request.response.await {
            Ok(item) => {
                sink.emit(
                    LifecycleEvent::new(EventKind::RequestEnd, id.clone(), ORIGIN)
                        .with_path(Some(LoadPath::DirectFetch)),
                );
                Some(item)
            }
            Err(FetchError::Cancelled) => None,
            Err(error) => {
                let dynerr: &dyn std::error::Error = &error; // tracing expects a `&dyn Error`
                tracing::warn!(resource = %id, error = dynerr, "Bootstrap fetch failed");
                None
            }
        };

        if let Some(inner) = inner.upgrade() {
            inner.finish(&id, generation);
        }
        let _ = sender.send(item);
    }

    /// Dispatches the native request of the task of `generation`, unless it has been cancelled.
    ///
    /// The token is stored under the same lock that [`Bootstrapper::cancel`] takes, so a
    /// dispatched request is always cancelled along with its task.
    fn dispatch(&self, id: &ResourceId, generation: u64) -> Option<NativeRequest<PlayableItem>> {
        let mut state = self.lock();
        let tracked = state
            .tasks
            .get_mut(id)
            .filter(|tracked| tracked.generation == generation)?;
        let request = self
            .platform
            .request_ready_item(id, QualityOptions::FULL_FIDELITY, None);
        tracked.token = Some(request.token);
        Some(request)
    }

    /// Forgets the task for `id` if it is still the one of `generation`.
    fn finish(&self, id: &ResourceId, generation: u64) {
        let mut state = self.lock();
        if state
            .tasks
            .get(id)
            .is_some_and(|tracked| tracked.generation == generation)
            && let Some(tracked) = state.tasks.remove(id)
        {
            // We are running on this very task.
            tracked.task.detach();
        }
    }
}
