//! Helpers for testing the pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Timing properties are best tested with `#[tokio::test(start_paused = true)]`. The
//!    [`ScriptedPlatform`] answers after Tokio sleeps, so virtual time drives it. Backoff
//!    windows use wall-clock time though, so tests around them need short windows and real
//!    sleeps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::caching::FetchError;
use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::platform::{MediaPlatform, NativeRequest, ProgressFn, RequestToken};
use crate::playback::{EngineEvent, EngineStatus, PlaybackEngine, PositionStore};
use crate::types::{CoarseResource, NativeHandle, PlayableItem, QualityOptions, ResourceId};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("reelwarm_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// How the [`ScriptedPlatform`] answers a request.
#[derive(Clone, Debug)]
pub enum Outcome {
    Succeed,
    Fail(FetchError),
    /// Never answers.
    Hang,
}

#[derive(Clone, Debug)]
struct Script {
    delay: Duration,
    outcome: Outcome,
}

/// A [`MediaPlatform`] that answers requests according to per-resource scripts.
///
/// Unscripted resources succeed after 100ms.
#[derive(Debug)]
pub struct ScriptedPlatform {
    default: Mutex<Script>,
    scripts: Mutex<HashMap<ResourceId, Script>>,
    next_token: AtomicU64,
    resource_requests: Mutex<Vec<(ResourceId, QualityOptions)>>,
    ready_requests: Mutex<Vec<(ResourceId, QualityOptions)>>,
    cancelled: Mutex<Vec<RequestToken>>,
    fail_make_playable: AtomicBool,
}

impl ScriptedPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            default: Mutex::new(Script {
                delay: Duration::from_millis(100),
                outcome: Outcome::Succeed,
            }),
            scripts: Mutex::default(),
            next_token: AtomicU64::new(1),
            resource_requests: Mutex::default(),
            ready_requests: Mutex::default(),
            cancelled: Mutex::default(),
            fail_make_playable: AtomicBool::new(false),
        })
    }

    /// Scripts the answer for all later requests of `id`.
    pub fn script(&self, id: &str, delay: Duration, outcome: Outcome) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.into(), Script { delay, outcome });
    }

    /// Scripts the answer for all later requests of unscripted resources.
    pub fn script_default(&self, delay: Duration, outcome: Outcome) {
        *self.default.lock().unwrap() = Script { delay, outcome };
    }

    pub fn fail_make_playable(&self, fail: bool) {
        self.fail_make_playable.store(fail, Ordering::SeqCst);
    }

    /// The number of coarse resource requests made for `id`.
    pub fn resource_requests(&self, id: &str) -> usize {
        let id = ResourceId::from(id);
        self.resource_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == id)
            .count()
    }

    /// The options of all ready-item requests made for `id`.
    pub fn ready_requests(&self, id: &str) -> Vec<QualityOptions> {
        let id = ResourceId::from(id);
        self.ready_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == id)
            .map(|(_, options)| *options)
            .collect()
    }

    pub fn total_requests(&self) -> usize {
        self.resource_requests.lock().unwrap().len() + self.ready_requests.lock().unwrap().len()
    }

    pub fn cancelled(&self) -> Vec<RequestToken> {
        self.cancelled.lock().unwrap().clone()
    }

    fn respond<T, F>(&self, id: &ResourceId, make: F) -> NativeRequest<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let token = RequestToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.default.lock().unwrap().clone());

        let response = async move {
            tokio::time::sleep(script.delay).await;
            match script.outcome {
                Outcome::Succeed => Ok(make()),
                Outcome::Fail(error) => Err(error),
                Outcome::Hang => std::future::pending().await,
            }
        };
        NativeRequest {
            token,
            response: response.boxed(),
        }
    }
}

impl MediaPlatform for ScriptedPlatform {
    fn request_resource(
        &self,
        id: &ResourceId,
        options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<CoarseResource> {
        self.resource_requests
            .lock()
            .unwrap()
            .push((id.clone(), options));
        if let Some(progress) = progress {
            progress(id, 0.0);
        }
        let owned = id.clone();
        self.respond(id, move || CoarseResource {
            handle: NativeHandle::new(format!("coarse:{owned}")),
            id: owned,
        })
    }

    fn request_ready_item(
        &self,
        id: &ResourceId,
        options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<PlayableItem> {
        self.ready_requests
            .lock()
            .unwrap()
            .push((id.clone(), options));
        if let Some(progress) = progress {
            progress(id, 0.0);
        }
        let owned = id.clone();
        self.respond(id, move || PlayableItem {
            handle: NativeHandle::new(format!("ready:{owned}")),
            id: owned,
        })
    }

    fn make_playable(&self, resource: &CoarseResource) -> Result<PlayableItem, FetchError> {
        if self.fail_make_playable.load(Ordering::SeqCst) {
            return Err(FetchError::Malformed("unsupported codec".into()));
        }
        Ok(PlayableItem {
            id: resource.id.clone(),
            handle: NativeHandle::new(format!("playable:{}", resource.id)),
        })
    }

    fn cancel_request(&self, token: RequestToken) {
        self.cancelled.lock().unwrap().push(token);
    }
}

/// A call made on a [`FakeEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    Replace(Option<ResourceId>),
    Play,
    Pause,
    Seek(Duration),
}

#[derive(Debug)]
struct FakeEngineState {
    item: Option<PlayableItem>,
    playing: bool,
    position: Duration,
    status: EngineStatus,
    buffering_sufficient: bool,
    calls: Vec<EngineCall>,
}

/// A [`PlaybackEngine`] that records every call.
///
/// With `auto_ready`, attaching an item immediately reports it ready to play.
#[derive(Debug)]
pub struct FakeEngine {
    auto_ready: bool,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<FakeEngineState>,
}

impl FakeEngine {
    pub fn new(auto_ready: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            auto_ready,
            events,
            state: Mutex::new(FakeEngineState {
                item: None,
                playing: false,
                position: Duration::ZERO,
                status: EngineStatus::Unknown,
                buffering_sufficient: true,
                calls: Vec::new(),
            }),
        })
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut state = self.state.lock().unwrap();
        match event {
            EngineEvent::Status(status) => state.status = status,
            EngineEvent::Buffering { sufficient } => state.buffering_sufficient = sufficient,
            EngineEvent::EndOfContent => {}
        }
        drop(state);
        let _ = self.events.send(event);
    }

    /// Moves the playback position forward.
    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().position += by;
    }

    pub fn set_position(&self, position: Duration) {
        self.state.lock().unwrap().position = position;
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub fn item(&self) -> Option<ResourceId> {
        self.state.lock().unwrap().item.as_ref().map(|item| item.id.clone())
    }

    pub fn item_handle(&self) -> Option<NativeHandle> {
        self.state
            .lock()
            .unwrap()
            .item
            .as_ref()
            .map(|item| item.handle.clone())
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }
}

impl PlaybackEngine for FakeEngine {
    fn replace_item(&self, item: Option<PlayableItem>) {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(EngineCall::Replace(item.as_ref().map(|i| i.id.clone())));
        let attached = item.is_some();
        state.item = item;
        state.playing = false;
        state.position = Duration::ZERO;
        state.status = EngineStatus::Unknown;
        if attached && self.auto_ready {
            state.status = EngineStatus::ReadyToPlay;
            drop(state);
            let _ = self
                .events
                .send(EngineEvent::Status(EngineStatus::ReadyToPlay));
        }
    }

    fn play(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Play);
        state.playing = true;
    }

    fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Pause);
        state.playing = false;
    }

    fn seek(&self, position: Duration) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Seek(position));
        state.position = position;
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn status(&self) -> EngineStatus {
        self.state.lock().unwrap().status
    }

    fn is_buffering_sufficient(&self) -> bool {
        self.state.lock().unwrap().buffering_sufficient
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// An [`EventSink`] that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The kinds of all events about `id`, in emission order.
    pub fn kinds(&self, id: &str) -> Vec<EventKind> {
        let id = ResourceId::from(id);
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.resource == id)
            .map(|event| event.kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A [`PositionStore`] backed by a map.
#[derive(Debug, Default)]
pub struct MemoryPositions {
    positions: Mutex<HashMap<ResourceId, Duration>>,
}

impl MemoryPositions {
    pub fn set(&self, id: &str, position: Duration) {
        self.positions.lock().unwrap().insert(id.into(), position);
    }
}

impl PositionStore for MemoryPositions {
    fn last_position(&self, id: &ResourceId) -> Option<Duration> {
        self.positions.lock().unwrap().get(id).copied()
    }
}
