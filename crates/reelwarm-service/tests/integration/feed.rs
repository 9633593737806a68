use std::time::Duration;

use reelwarm_service::events::{EventKind, LoadPath};
use reelwarm_service::playback::PlaybackState;
use reelwarm_service::prefetch::TargetSize;
use reelwarm_service::types::FeedItem;
use tokio::time::sleep;

use crate::{FakeEngine, finish_boot, ids, setup_services, video_feed};

#[tokio::test(start_paused = true)]
async fn test_scrolling_moves_the_window() {
    let (services, platform, _sink) = setup_services(|_| {});
    finish_boot(&services);
    let pager = services.feed_pager();

    let diff = pager.set_items(video_feed(20));
    assert_eq!(diff.added, ids(0..=8));
    assert_eq!(services.coarse.stats().in_flight, 9);
    assert_eq!(services.ready.stats().in_flight, 9);

    let diff = pager.on_position_changed(5);
    assert_eq!(diff.added, ids(9..=13));
    assert_eq!(diff.removed, ids(0..=3));
    assert_eq!(services.scheduler.issued(), ids(4..=13));

    // Each cancelled id had a request in flight on both caches.
    assert_eq!(platform.cancelled().len(), 8);
    assert_eq!(platform.resource_requests("9"), 1);
    assert_eq!(platform.resource_requests("4"), 1);
    assert_eq!(services.coarse.stats().in_flight, 10);

    // Same position again, nothing happens.
    assert!(pager.on_position_changed(5).is_empty());
    assert_eq!(platform.total_requests(), 2 * 14);
}

#[tokio::test(start_paused = true)]
async fn test_critical_window_only_warms_current_item() {
    let (services, platform, _sink) = setup_services(|_| {});
    let pager = services.feed_pager();

    let diff = pager.set_items(video_feed(20));
    assert_eq!(diff.added, ids([0]));
    assert_eq!(platform.total_requests(), 2);

    finish_boot(&services);
    let diff = pager.refresh();
    assert_eq!(diff.added, ids(1..=8));
    assert!(diff.removed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_page_readiness() {
    let (services, _platform, _sink) = setup_services(|_| {});
    finish_boot(&services);
    let pager = services.feed_pager();
    pager.set_items(vec![
        FeedItem::video("clip"),
        FeedItem::image("poster"),
        FeedItem::video("later"),
    ]);

    assert!(!pager.is_page_ready(0));
    assert!(pager.is_page_ready(1));
    assert!(!pager.is_page_ready(3));

    sleep(Duration::from_millis(150)).await;
    assert!(pager.is_page_ready(0));
    assert!(pager.is_page_ready(2));
}

#[tokio::test(start_paused = true)]
async fn test_host_prefetch_outside_window() {
    let (services, platform, _sink) = setup_services(|config| config.prefetch.lookahead = 1);
    finish_boot(&services);
    let pager = services.feed_pager();
    pager.set_items(video_feed(10));
    assert_eq!(services.scheduler.issued(), ids(0..=1));

    let size = TargetSize {
        width: 1080,
        height: 1920,
    };
    pager.on_prefetch(&[5, 6], size);
    assert_eq!(platform.resource_requests("5"), 1);
    assert_eq!(platform.resource_requests("6"), 1);

    // Ids inside the window stay warm.
    pager.on_cancel_prefetch(&[1, 5], size);
    assert!(services.coarse.is_in_flight(&"1".into()));
    assert!(!services.coarse.is_in_flight(&"5".into()));
    assert!(services.coarse.is_in_flight(&"6".into()));
}

#[tokio::test(start_paused = true)]
async fn test_centered_cell_plays_prefetched_items() {
    let (services, platform, sink) = setup_services(|_| {});
    finish_boot(&services);
    let pager = services.feed_pager();
    pager.set_items(video_feed(20));
    sleep(Duration::from_millis(150)).await;

    let engine = FakeEngine::new(true);
    let controller = services.controller(engine.clone());
    controller.set_active(true);

    for position in 0..3 {
        pager.on_position_changed(position);
        let item = pager.item(position).unwrap();
        controller.assign(item.id.clone());
        sleep(Duration::from_millis(1)).await;

        assert_eq!(controller.state(), PlaybackState::Playing);
        assert_eq!(controller.load_path(), Some(LoadPath::ReadyItemCache));
        assert_eq!(engine.item(), Some(item.id));
    }

    // Everything came from the prefetched window, nothing was fetched directly.
    assert_eq!(platform.ready_requests("0").len(), 1);
    assert_eq!(sink.count(EventKind::Failed), 0);
    assert_eq!(sink.count(EventKind::ItemReady), 3);
}

#[tokio::test(start_paused = true)]
async fn test_leaving_the_window_cancels_waiting_controller() {
    let (services, platform, _sink) = setup_services(|_| {});
    finish_boot(&services);
    platform.script("0", Duration::from_secs(5), crate::Outcome::Succeed);
    let pager = services.feed_pager();
    pager.set_items(video_feed(20));

    let engine = FakeEngine::new(true);
    let controller = services.controller(engine.clone());
    controller.assign("0".into());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(services.ready.stats().waiters, 1);

    // Scrolling far away cancels the window, which resolves the waiting controller with a miss.
    pager.on_position_changed(15);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(services.ready.stats().waiters, 0);
    assert_eq!(controller.state(), PlaybackState::Loading);

    controller.cancel();
    assert_eq!(controller.state(), PlaybackState::Idle);
    assert_eq!(engine.item(), None);
}
