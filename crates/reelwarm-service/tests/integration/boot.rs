use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reelwarm_service::boot::BootPhase;
use reelwarm_service::events::{EventKind, LoadPath};
use reelwarm_service::orchestrator::{ManagedService, ServiceDescriptor, StartGate};
use reelwarm_service::playback::PlaybackState;
use reelwarm_service::types::QualityOptions;
use tokio::time::{Instant, sleep};

use crate::{FakeEngine, finish_boot, setup_services, video_feed};

#[derive(Default)]
struct AccountSync {
    prepared: AtomicUsize,
    started: AtomicUsize,
}

#[async_trait]
impl ManagedService for AccountSync {
    async fn prepare(&self) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {}
}

#[tokio::test(start_paused = true)]
async fn test_gated_service_starts_after_first_content() {
    let (services, _platform, _sink) = setup_services(|_| {});
    let service = Arc::new(AccountSync::default());
    assert!(services.orchestrator.register(ServiceDescriptor::new(
        "account_sync",
        service.clone(),
        StartGate::AfterFirstContentReady {
            delay: Duration::from_secs(3),
        },
    )));

    let start = Instant::now();
    let starting = tokio::spawn({
        let orchestrator = services.orchestrator.clone();
        async move { orchestrator.ensure_started("account_sync").await }
    });

    // The app boots and the first cell starts playing.
    sleep(Duration::from_secs(1)).await;
    finish_boot(&services);
    let engine = FakeEngine::new(true);
    let controller = services.controller(engine.clone());
    controller.set_active(true);
    controller.assign("intro".into());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert!(services.gate.has_reached(BootPhase::FirstContentReady));
    assert_eq!(service.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(service.started.load(Ordering::SeqCst), 0);

    assert!(starting.await.unwrap());
    // First content was ready at 1.1s, then the 3s delay.
    assert_eq!(start.elapsed(), Duration::from_millis(4_100));
    assert_eq!(service.started.load(Ordering::SeqCst), 1);
    assert!(services.orchestrator.is_started("account_sync"));
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_waits_for_foreground() {
    let (services, platform, sink) = setup_services(|_| {});
    let pager = services.feed_pager();
    pager.set_items(video_feed(5));

    let engine = FakeEngine::new(true);
    let controller = services.controller(engine.clone());
    controller.set_active(true);
    controller.assign("0".into());

    // In the critical window, only the current item is prefetched.
    assert_eq!(services.scheduler.issued(), vec!["0".into()]);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(controller.load_path(), Some(LoadPath::ReadyItemCache));
    // Not foreground-active yet, so the item waits paused.
    assert_eq!(controller.state(), PlaybackState::Paused);

    services.gate.mark(BootPhase::FirstFrameRendered);
    services.gate.set_foreground(true);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert!(engine.is_playing());

    assert!(platform.ready_requests("0").iter().all(|options| *options == QualityOptions::PREFETCH));
    assert_eq!(sink.count(EventKind::Failed), 0);
}

#[tokio::test(start_paused = true)]
async fn test_direct_fetch_before_foreground_is_bounded() {
    let (services, platform, _sink) = setup_services(|config| {
        config.boot.foreground_wait = Duration::from_secs(5);
    });

    let engine = FakeEngine::new(true);
    let controller = services.controller(engine.clone());
    controller.assign("deep-link".into());

    sleep(Duration::from_secs(4)).await;
    assert_eq!(controller.state(), PlaybackState::Loading);
    assert!(platform.ready_requests("deep-link").is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(controller.load_path(), Some(LoadPath::DirectFetch));
    assert_eq!(
        platform.ready_requests("deep-link"),
        vec![QualityOptions::FULL_FIDELITY]
    );
}
