//! Simulated collaborators of the pipeline.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use reelwarm_service::caching::{FetchError, FetchResult};
use reelwarm_service::events::{EventSink, LifecycleEvent};
use reelwarm_service::orchestrator::ManagedService;
use reelwarm_service::platform::{MediaPlatform, NativeRequest, ProgressFn, RequestToken};
use reelwarm_service::playback::{EngineEvent, EngineStatus, PlaybackEngine};
use reelwarm_service::types::{
    CoarseResource, NativeHandle, PlayableItem, QualityOptions, ResourceId,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::workloads::PlatformProfile;

/// Answers requests after a random latency, failing some of them.
#[derive(Debug)]
pub struct SimulatedPlatform {
    profile: PlatformProfile,
    next_token: AtomicU64,
    requests: AtomicUsize,
    cancelled: AtomicUsize,
}

impl SimulatedPlatform {
    pub fn new(profile: PlatformProfile) -> Self {
        Self {
            profile,
            next_token: AtomicU64::new(1),
            requests: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn respond<T, F>(
        &self,
        id: &ResourceId,
        progress: Option<ProgressFn>,
        make: F,
    ) -> NativeRequest<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let token = RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed));

        // `ThreadRng` must not live across an await point.
        let (latency, outcome) = {
            let mut rng = rand::rng();
            let min = self.profile.min_latency;
            let max = self.profile.max_latency.max(min);
            let latency = rng.random_range(min..=max);
            let roll: f64 = rng.random();
            let outcome = if roll < self.profile.permanent_failure_rate {
                Err(FetchError::Malformed("simulated decode failure".into()))
            } else if roll < self.profile.permanent_failure_rate + self.profile.transient_failure_rate
            {
                Err(FetchError::Unavailable("simulated network outage".into()))
            } else {
                Ok(())
            };
            (latency, outcome)
        };

        let id = id.clone();
        let response = async move {
            if let Some(progress) = &progress {
                progress(&id, 0.0);
            }
            tokio::time::sleep(latency).await;
            if let Err(error) = outcome {
                return Err(error);
            }
            if let Some(progress) = &progress {
                progress(&id, 1.0);
            }
            Ok(make())
        };
        NativeRequest {
            token,
            response: response.boxed(),
        }
    }
}

impl MediaPlatform for SimulatedPlatform {
    fn request_resource(
        &self,
        id: &ResourceId,
        _options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<CoarseResource> {
        let owned = id.clone();
        self.respond(id, progress, move || CoarseResource {
            handle: NativeHandle::new(owned.to_string()),
            id: owned,
        })
    }

    fn request_ready_item(
        &self,
        id: &ResourceId,
        _options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<PlayableItem> {
        let owned = id.clone();
        self.respond(id, progress, move || PlayableItem {
            handle: NativeHandle::new(owned.to_string()),
            id: owned,
        })
    }

    fn make_playable(&self, resource: &CoarseResource) -> FetchResult<PlayableItem> {
        Ok(PlayableItem {
            id: resource.id.clone(),
            handle: resource.handle.clone(),
        })
    }

    fn cancel_request(&self, _token: RequestToken) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct EngineState {
    attached: bool,
    /// When playback last resumed, if playing.
    playing_since: Option<Instant>,
    /// The position when playback last paused.
    position: Duration,
    stalling: bool,
}

/// An engine that becomes ready right away and advances its position in real time.
#[derive(Debug)]
pub struct SimulatedEngine {
    stall_rate: f64,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl SimulatedEngine {
    pub fn new(stall_rate: f64) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            stall_rate,
            events,
            state: Mutex::new(EngineState {
                attached: false,
                playing_since: None,
                position: Duration::ZERO,
                stalling: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PlaybackEngine for SimulatedEngine {
    fn replace_item(&self, item: Option<PlayableItem>) {
        let stalling = rand::rng().random_bool(self.stall_rate.clamp(0.0, 1.0));
        {
            let mut state = self.lock();
            state.attached = item.is_some();
            state.playing_since = None;
            state.position = Duration::ZERO;
            state.stalling = stalling;
        }
        if item.is_some() {
            let _ = self.events.send(EngineEvent::Status(EngineStatus::ReadyToPlay));
        }
    }

    fn play(&self) {
        let mut state = self.lock();
        if state.attached && state.playing_since.is_none() {
            state.playing_since = Some(Instant::now());
        }
    }

    fn pause(&self) {
        let mut state = self.lock();
        if let Some(since) = state.playing_since.take()
            && !state.stalling
        {
            state.position += since.elapsed();
        }
    }

    fn seek(&self, position: Duration) {
        let mut state = self.lock();
        state.position = position;
        if state.playing_since.is_some() {
            state.playing_since = Some(Instant::now());
        }
    }

    fn position(&self) -> Duration {
        let state = self.lock();
        match state.playing_since {
            Some(since) if !state.stalling => state.position + since.elapsed(),
            _ => state.position,
        }
    }

    fn status(&self) -> EngineStatus {
        match self.lock().attached {
            true => EngineStatus::ReadyToPlay,
            false => EngineStatus::Unknown,
        }
    }

    fn is_buffering_sufficient(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Forwards lifecycle events to the session driving the pipeline.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        tracing::trace!(kind = %event.kind, resource = %event.resource, origin = event.origin, "Lifecycle event");
        // The session may already be gone.
        let _ = self.sender.send(event);
    }
}

/// A heavyweight background service, such as an account sync, that should not compete with the
/// first content.
#[derive(Debug, Default)]
pub struct SimulatedService {
    pub starts: AtomicUsize,
}

#[async_trait]
impl ManagedService for SimulatedService {
    async fn prepare(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn start(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_platform_latency_within_profile() {
        let platform = SimulatedPlatform::new(PlatformProfile {
            min_latency: Duration::from_millis(100),
            max_latency: Duration::from_millis(200),
            transient_failure_rate: 0.0,
            permanent_failure_rate: 0.0,
            stall_rate: 0.0,
        });

        let start = Instant::now();
        let request = platform.request_ready_item(&"a".into(), QualityOptions::PREFETCH, None);
        let item = request.response.await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(item.id, ResourceId::from("a"));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(200));
        assert_eq!(platform.requests(), 1);
    }

    #[tokio::test]
    async fn test_platform_failures() {
        let platform = SimulatedPlatform::new(PlatformProfile {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            transient_failure_rate: 1.0,
            permanent_failure_rate: 0.0,
            stall_rate: 0.0,
        });
        let request = platform.request_resource(&"a".into(), QualityOptions::PREFETCH, None);
        let error = request.response.await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_position() {
        let engine = SimulatedEngine::new(0.0);
        let mut events = engine.subscribe();
        engine.replace_item(Some(PlayableItem {
            id: "a".into(),
            handle: NativeHandle::new(()),
        }));
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::Status(EngineStatus::ReadyToPlay)
        );

        engine.play();
        tokio::time::sleep(Duration::from_secs(2)).await;
        engine.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.position(), Duration::from_secs(2));

        engine.seek(Duration::ZERO);
        assert_eq!(engine.position(), Duration::ZERO);
    }
}
