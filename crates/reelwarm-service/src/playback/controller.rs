use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::boot::{BootPhase, BootPhaseGate};
use crate::bootstrap::Bootstrapper;
use crate::caching::{CoarseResources, ReadyItems, ResourceCache};
use crate::config::PlaybackConfig;
use crate::events::{EventKind, EventSink, LifecycleEvent, LoadPath};
use crate::platform::MediaPlatform;
use crate::types::{PlayableItem, ResourceId};
use crate::utils::futures::CancelOnDrop;

use super::{EngineEvent, EngineId, EngineStatus, PlaybackEngine, PlaybackRegistry, PositionStore};

const ORIGIN: &str = "playback_controller";

/// The lifecycle state of a [`PlaybackController`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    /// No resource is assigned.
    Idle,
    /// Resolving a playable item through the load paths.
    Loading,
    /// The item is attached to the engine, which is not ready yet.
    Applying,
    /// The engine is ready to play.
    Ready,
    Playing,
    Paused,
    /// No playable item could be loaded, or the engine failed on it.
    ///
    /// Terminal for the assigned resource.
    Failed,
    /// The assignment is being torn down. Settles in [`Idle`](Self::Idle).
    Cancelled,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Applying => "applying",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the engine holds an item of this controller.
    fn is_attached(self) -> bool {
        matches!(
            self,
            Self::Applying | Self::Ready | Self::Playing | Self::Paused
        )
    }

    /// Whether the engine has reported the item ready.
    fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a [`PlaybackController`] needs besides its engine.
///
/// All controllers of a feed share the same dependencies.
#[derive(Clone)]
pub struct PlaybackDeps {
    pub ready: ResourceCache<ReadyItems>,
    pub coarse: ResourceCache<CoarseResources>,
    pub bootstrapper: Bootstrapper,
    pub platform: Arc<dyn MediaPlatform>,
    pub registry: Arc<PlaybackRegistry>,
    pub gate: Arc<BootPhaseGate>,
    pub positions: Arc<dyn PositionStore>,
    pub sink: Arc<dyn EventSink>,
    /// How long to wait on the ready-item cache before trying the coarse cache.
    pub ready_wait: Duration,
    /// How long to wait on the coarse cache before fetching directly.
    pub coarse_wait: Duration,
    pub playback: PlaybackConfig,
}

/// Turns position samples into stall events.
///
/// While playing, a position that moves by no more than `tolerance` for longer than `threshold`
/// is a stall, which lasts until the position moves again.
#[derive(Debug)]
struct StallWatchdog {
    threshold: Duration,
    tolerance: Duration,
    last_position: Option<Duration>,
    /// Since when the position has been standing still while playing.
    still_since: Option<Instant>,
    stalled: bool,
    first_frame_shown: bool,
}

impl StallWatchdog {
    fn new(config: &PlaybackConfig) -> Self {
        Self {
            threshold: config.stall_threshold,
            tolerance: config.stall_tolerance,
            last_position: None,
            still_since: None,
            stalled: false,
            first_frame_shown: false,
        }
    }

    fn observe(&mut self, now: Instant, position: Duration, playing: bool) -> Vec<EventKind> {
        let mut events = Vec::new();
        let last_position = self.last_position.replace(position);

        if !playing {
            self.still_since = None;
            if std::mem::take(&mut self.stalled) {
                events.push(EventKind::StallEnd);
            }
            return events;
        }

        let advanced = last_position.is_some_and(|last| position.abs_diff(last) > self.tolerance);
        if advanced {
            self.still_since = Some(now);
            if !std::mem::replace(&mut self.first_frame_shown, true) {
                events.push(EventKind::FirstFrameShown);
            }
            if std::mem::take(&mut self.stalled) {
                events.push(EventKind::StallEnd);
            }
        } else {
            let since = *self.still_since.get_or_insert(now);
            if !self.stalled && now.duration_since(since) > self.threshold {
                self.stalled = true;
                events.push(EventKind::StallBegin);
            }
        }
        events
    }
}

struct ControllerState {
    state: PlaybackState,
    resource: Option<ResourceId>,
    path: Option<LoadPath>,
    /// Bumped on every teardown, so a stale driver can tell it lost its assignment.
    epoch: u64,
    active: bool,
    foreground: bool,
    stalled: bool,
    /// Whether the load reached the bootstrapper, whose fetch is then ours to cancel.
    owns_bootstrap: bool,
    assigned_at: Instant,
    driver: Option<CancelOnDrop<()>>,
}

/// What is left to do for a teardown once the state lock is released.
struct Teardown {
    resource: ResourceId,
    path: Option<LoadPath>,
    driver: Option<CancelOnDrop<()>>,
    cancel_bootstrap: bool,
    report: bool,
}

struct Inner {
    deps: PlaybackDeps,
    engine: Arc<dyn PlaybackEngine>,
    engine_id: EngineId,
    state: Mutex<ControllerState>,
}

/// Drives the playback engine of one feed cell.
///
/// Assigning a resource spawns a driver task that resolves a playable item, attaches it to the
/// engine and then follows the engine's notifications, the foreground flag and a periodic
/// position sampler until the assignment is torn down. Assigning therefore requires a Tokio
/// runtime.
///
/// Dropping the controller cancels the current assignment and unregisters the engine.
pub struct PlaybackController {
    inner: Arc<Inner>,
}

impl fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PlaybackController")
            .field("engine", &self.inner.engine_id)
            .field("state", &state.state)
            .field("resource", &state.resource)
            .field("path", &state.path)
            .field("active", &state.active)
            .finish()
    }
}

impl PlaybackController {
    /// Creates a controller for `engine` and registers the engine.
    pub fn new(deps: PlaybackDeps, engine: Arc<dyn PlaybackEngine>) -> Self {
        let engine_id = deps.registry.register(&engine);
        let foreground = deps.gate.is_foreground_active();
        Self {
            inner: Arc::new(Inner {
                deps,
                engine,
                engine_id,
                state: Mutex::new(ControllerState {
                    state: PlaybackState::Idle,
                    resource: None,
                    path: None,
                    epoch: 0,
                    active: false,
                    foreground,
                    stalled: false,
                    owns_bootstrap: false,
                    assigned_at: Instant::now(),
                    driver: None,
                }),
            }),
        }
    }

    /// Assigns `id` to this cell and starts loading it.
    ///
    /// A previously assigned resource is torn down first. Assigning the current resource again
    /// does nothing, including after a failure.
    pub fn assign(&self, id: ResourceId) {
        let teardown = {
            let mut state = self.inner.lock();
            if state.resource.as_ref() == Some(&id) {
                return;
            }
            let teardown = self.inner.teardown(&mut state);

            tracing::debug!(resource = %id, engine = %self.inner.engine_id, "Assigned resource");
            state.resource = Some(id.clone());
            state.state = PlaybackState::Loading;
            state.assigned_at = Instant::now();
            let epoch = state.epoch;
            let driver = tokio::spawn(Arc::clone(&self.inner).drive(id, epoch));
            state.driver = Some(CancelOnDrop::new(driver));
            teardown
        };
        if let Some(teardown) = teardown {
            self.inner.finish_teardown(teardown);
        }
    }

    /// Tears down the current assignment and returns to [`PlaybackState::Idle`].
    pub fn cancel(&self) {
        let (teardown, epoch) = {
            let mut state = self.inner.lock();
            (self.inner.teardown(&mut state), state.epoch)
        };
        let Some(teardown) = teardown else {
            return;
        };
        self.inner.finish_teardown(teardown);

        let mut state = self.inner.lock();
        if state.epoch == epoch && state.state == PlaybackState::Cancelled {
            state.state = PlaybackState::Idle;
        }
    }

    /// Sets whether this is the centered cell.
    pub fn set_active(&self, active: bool) {
        let mut state = self.inner.lock();
        state.active = active;
        self.inner.reconcile(&mut state);
    }

    /// Overrides the foreground flag until the next change of the app's foreground state.
    pub fn set_foreground(&self, foreground: bool) {
        let mut state = self.inner.lock();
        state.foreground = foreground;
        self.inner.reconcile(&mut state);
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    pub fn is_stalled(&self) -> bool {
        self.inner.lock().stalled
    }

    pub fn resource(&self) -> Option<ResourceId> {
        self.inner.lock().resource.clone()
    }

    /// The load path that delivered the current item, once it is attached.
    pub fn load_path(&self) -> Option<LoadPath> {
        self.inner.lock().path
    }

    pub fn engine_id(&self) -> EngineId {
        self.inner.engine_id
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.cancel();
        self.inner.deps.registry.unregister(self.inner.engine_id);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: EventKind, resource: &ResourceId, path: Option<LoadPath>) {
        self.deps
            .sink
            .emit(LifecycleEvent::new(kind, resource.clone(), ORIGIN).with_path(path));
    }

    /// Runs `f` on the state if the assignment of `epoch` is still current.
    ///
    /// Events pushed by `f` are emitted after the lock is released.
    fn update<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut ControllerState, &mut Vec<EventKind>) -> R,
    ) -> Option<R> {
        let mut events = Vec::new();
        let (result, resource, path) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return None;
            }
            let result = f(&mut state, &mut events);
            (result, state.resource.clone(), state.path)
        };
        if let Some(resource) = resource {
            for kind in events {
                self.emit(kind, &resource, path);
            }
        }
        Some(result)
    }

    /// Detaches the current assignment from the state.
    ///
    /// Must be followed by [`finish_teardown`](Self::finish_teardown) outside the lock.
    fn teardown(&self, state: &mut ControllerState) -> Option<Teardown> {
        let resource = state.resource.take()?;
        state.epoch += 1;

        if state.state.is_attached() {
            self.engine.pause();
            self.engine.replace_item(None);
        }
        let teardown = Teardown {
            resource,
            path: state.path.take(),
            driver: state.driver.take(),
            cancel_bootstrap: std::mem::take(&mut state.owns_bootstrap),
            report: state.state != PlaybackState::Failed,
        };
        state.state = PlaybackState::Cancelled;
        state.stalled = false;
        Some(teardown)
    }

    fn finish_teardown(&self, teardown: Teardown) {
        drop(teardown.driver);
        if teardown.cancel_bootstrap {
            self.deps.bootstrapper.cancel(&teardown.resource);
        }
        if teardown.report {
            tracing::debug!(resource = %teardown.resource, engine = %self.engine_id, "Cancelled playback");
            self.emit(EventKind::Cancelled, &teardown.resource, teardown.path);
        }
    }

    /// Plays or pauses according to the play conditions.
    fn reconcile(&self, state: &mut ControllerState) {
        if !state.state.is_ready() {
            return;
        }
        let should_play =
            state.active && state.foreground && self.engine.is_buffering_sufficient();
        match (should_play, state.state) {
            (true, PlaybackState::Ready | PlaybackState::Paused) => {
                self.deps.registry.pause_others(self.engine_id);
                self.engine.play();
                state.state = PlaybackState::Playing;
            }
            (false, PlaybackState::Ready | PlaybackState::Playing) => {
                self.engine.pause();
                state.state = PlaybackState::Paused;
            }
            _ => {}
        }
    }

    /// The first item ready in the process marks [`BootPhase::FirstContentReady`].
    fn on_ready(&self, state: &mut ControllerState, events: &mut Vec<EventKind>) {
        let position = state
            .resource
            .as_ref()
            .and_then(|id| self.deps.positions.last_position(id))
            .unwrap_or_default();
        self.engine.seek(position);
        state.state = PlaybackState::Ready;
        events.push(EventKind::ItemReady);
        self.deps.gate.mark(BootPhase::FirstContentReady);

        let path = state.path.map_or("none", LoadPath::as_str);
        metric!(timer("playback.time_to_ready") = state.assigned_at.elapsed(), "path" => path);
        self.reconcile(state);
    }

    fn fail(&self, state: &mut ControllerState, events: &mut Vec<EventKind>) {
        if let Some(id) = &state.resource {
            tracing::warn!(resource = %id, engine = %self.engine_id, from = %state.state, "Playback failed");
        }
        self.engine.replace_item(None);
        state.state = PlaybackState::Failed;
        state.stalled = false;
        events.push(EventKind::Failed);
    }

    /// Handles an engine notification. Returns whether the driver keeps running.
    fn on_engine_event(
        &self,
        state: &mut ControllerState,
        event: EngineEvent,
        events: &mut Vec<EventKind>,
    ) -> bool {
        match event {
            EngineEvent::Status(EngineStatus::ReadyToPlay) => {
                if state.state == PlaybackState::Applying {
                    self.on_ready(state, events);
                }
            }
            EngineEvent::Status(EngineStatus::Failed) => {
                self.fail(state, events);
                return false;
            }
            EngineEvent::Status(EngineStatus::Unknown) => {}
            EngineEvent::Buffering { .. } => self.reconcile(state),
            EngineEvent::EndOfContent => {
                if state.state.is_ready() {
                    self.engine.seek(Duration::ZERO);
                    if state.state == PlaybackState::Playing {
                        self.engine.play();
                    }
                }
            }
        }
        true
    }

    /// Catches up with the engine after missing notifications.
    fn resync(&self, state: &mut ControllerState, events: &mut Vec<EventKind>) -> bool {
        match self.engine.status() {
            EngineStatus::Failed => {
                self.fail(state, events);
                return false;
            }
            EngineStatus::ReadyToPlay if state.state == PlaybackState::Applying => {
                self.on_ready(state, events)
            }
            _ => self.reconcile(state),
        }
        true
    }

    fn sample(
        &self,
        state: &mut ControllerState,
        watchdog: &mut StallWatchdog,
        events: &mut Vec<EventKind>,
    ) {
        if !state.state.is_ready() {
            return;
        }
        let playing = state.state == PlaybackState::Playing;
        for kind in watchdog.observe(Instant::now(), self.engine.position(), playing) {
            match kind {
                EventKind::StallBegin => {
                    metric!(counter("playback.stall") += 1);
                    state.stalled = true;
                }
                EventKind::StallEnd => state.stalled = false,
                _ => {}
            }
            events.push(kind);
        }
    }

    /// Resolves a playable item, trying the load paths in order.
    async fn load(&self, id: &ResourceId, epoch: u64) -> Option<(PlayableItem, LoadPath)> {
        let deps = &self.deps;
        if let Some(item) = deps.ready.request_or_wait(id, deps.ready_wait).await {
            return Some((item, LoadPath::ReadyItemCache));
        }

        if let Some(resource) = deps.coarse.request_or_wait(id, deps.coarse_wait).await {
            match deps.platform.make_playable(&resource) {
                Ok(item) => return Some((item, LoadPath::CoarseCache)),
                Err(error) => {
                    let dynerr: &dyn std::error::Error = &error; // tracing expects a `&dyn Error`
                    tracing::warn!(resource = %id, error = dynerr, "Coarse resource is not playable");
                }
            }
        }

        self.update(epoch, |state, _| state.owns_bootstrap = true)?;
        let item = deps.bootstrapper.await_result(id).await?;
        Some((item, LoadPath::DirectFetch))
    }

    /// The driver task of one assignment.
    async fn drive(self: Arc<Self>, id: ResourceId, epoch: u64) {
        let Some((item, path)) = self.load(&id, epoch).await else {
            self.update(epoch, |state, events| self.fail(state, events));
            return;
        };

        let mut engine_events = self.engine.subscribe();
        let applied = self.update(epoch, |state, events| {
            state.path = Some(path);
            state.state = PlaybackState::Applying;
            self.engine.replace_item(Some(item));
            events.push(EventKind::ItemApplied);
            self.resync(state, events)
        });
        if applied != Some(true) {
            return;
        }

        let mut sampler = tokio::time::interval(self.deps.playback.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut foreground = self.deps.gate.subscribe_foreground();
        let mut watchdog = StallWatchdog::new(&self.deps.playback);

        loop {
            let keep_running = tokio::select! {
                event = engine_events.recv() => match event {
                    Ok(event) => {
                        self.update(epoch, |state, events| self.on_engine_event(state, event, events))
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(resource = %id, skipped, "Missed engine notifications");
                        self.update(epoch, |state, events| self.resync(state, events))
                    }
                    Err(RecvError::Closed) => None,
                },
                _ = sampler.tick() => self.update(epoch, |state, events| {
                    self.sample(state, &mut watchdog, events);
                    true
                }),
                Ok(()) = foreground.changed() => {
                    let active = *foreground.borrow_and_update();
                    self.update(epoch, |state, _| {
                        state.foreground = active;
                        self.reconcile(state);
                        true
                    })
                }
            };
            if keep_running != Some(true) {
                break;
            }
        }
    }
}
