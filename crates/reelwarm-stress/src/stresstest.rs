use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reelwarm_service::boot::BootPhase;
use reelwarm_service::caching::CacheStats;
use reelwarm_service::config::Config;
use reelwarm_service::events::{EventKind, LifecycleEvent, LoadPath};
use reelwarm_service::orchestrator::{ServiceDescriptor, StartGate};
use reelwarm_service::playback::{PlaybackController, PlaybackState};
use reelwarm_service::services::SharedServices;
use reelwarm_service::types::{FeedItem, MediaKind, ResourceId};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

use crate::simulation::{ChannelSink, SimulatedEngine, SimulatedPlatform, SimulatedService};
use crate::workloads::{Workload, WorkloadsConfig};

/// How long a session waits for an assigned item before giving up on it.
const ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// Results of all sessions of one workload.
#[derive(Default)]
struct Report {
    sessions: usize,
    time_to_ready: DDSketch,
    paths: BTreeMap<&'static str, usize>,
    failed: usize,
    timed_out: usize,
    requests: usize,
    cancelled_requests: usize,
    background_starts: usize,
    /// Leftovers in the caches at the end of each session.
    ready_stats: Vec<CacheStats>,
}

enum Outcome {
    Ready(Option<LoadPath>),
    Failed,
    TimedOut,
}

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let start = Instant::now();
    let deadline = start + duration;

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let concurrency = workload.concurrency.max(1);
        let workload = Arc::new(workload);
        let service_config = service_config.clone();

        let task = tokio::spawn(async move {
            let report = Arc::new(Mutex::new(Report::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            let mut session = 0;
            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let report = Arc::clone(&report);
                        let config = service_config.clone();
                        let prefix = format!("w{i}-s{session}");
                        session += 1;

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest.session", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            run_session(config, &workload, &prefix, deadline, &report).await;

                            transaction.finish();

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the permits, we essentially wait for all outstanding sessions to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let report = std::mem::take(&mut *report.lock().unwrap_or_else(PoisonError::into_inner));
            (concurrency, report)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;
    let elapsed = start.elapsed();

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, report) = task.context("workload task panicked")?;
        print_report(i, concurrency, &report, elapsed);
    }

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    sketch
        .quantile(q)
        .ok()
        .flatten()
        .map_or(Duration::ZERO, Duration::from_secs_f64)
}

fn print_report(i: usize, concurrency: usize, report: &Report, elapsed: Duration) {
    let ops = report.time_to_ready.count();
    let ops_ps = ops as f64 / elapsed.as_secs_f64().max(1.0);
    println!(
        "Workload {i} (concurrency: {concurrency}): {} sessions, {ops} items ready, {ops_ps:.2} items/s",
        report.sessions
    );

    if ops > 0 {
        let avg = report
            .time_to_ready
            .sum()
            .map_or(Duration::ZERO, |sum| Duration::from_secs_f64(sum / ops as f64));
        let p50 = quantile(&report.time_to_ready, 0.5);
        let p90 = quantile(&report.time_to_ready, 0.9);
        let p99 = quantile(&report.time_to_ready, 0.99);
        println!("  time to ready avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let paths: Vec<_> = report
        .paths
        .iter()
        .map(|(path, count)| format!("{path}: {count}"))
        .collect();
    println!("  load paths: {}", paths.join(", "));
    println!(
        "  failed: {}; timed out: {}; native requests: {}; cancelled: {}",
        report.failed, report.timed_out, report.requests, report.cancelled_requests
    );

    let leftover_waiters: usize = report.ready_stats.iter().map(|stats| stats.waiters).sum();
    let leftover_in_flight: usize = report.ready_stats.iter().map(|stats| stats.in_flight).sum();
    println!(
        "  background service starts: {}; leftover waiters: {leftover_waiters}; leftover in-flight: {leftover_in_flight}",
        report.background_starts
    );
    println!();
}

fn generate_feed(prefix: &str, workload: &Workload) -> Vec<FeedItem> {
    let mut rng = rand::rng();
    let image_ratio = workload.image_ratio.clamp(0.0, 1.0);
    (0..workload.feed_length.max(1))
        .map(|n| {
            let id = format!("{prefix}-{n}");
            if rng.random_bool(image_ratio) {
                FeedItem::image(id)
            } else {
                FeedItem::video(id)
            }
        })
        .collect()
}

/// Boots the pipeline for one app launch and scrolls through the feed once.
async fn run_session(
    config: Config,
    workload: &Workload,
    prefix: &str,
    deadline: Instant,
    report: &Mutex<Report>,
) {
    let platform = Arc::new(SimulatedPlatform::new(workload.platform.clone()));
    let (sink, mut events) = ChannelSink::new();
    let services = SharedServices::new(config, platform.clone(), Arc::new(sink));

    let background = Arc::new(SimulatedService::default());
    services.orchestrator.register(ServiceDescriptor::new(
        "background_sync",
        background.clone(),
        StartGate::AfterFirstContentReady {
            delay: Duration::from_secs(1),
        },
    ));
    let starting = tokio::spawn({
        let orchestrator = services.orchestrator.clone();
        async move { orchestrator.ensure_started("background_sync").await }
    });

    let pager = services.feed_pager();
    pager.set_items(generate_feed(prefix, workload));

    let controller = services.controller(Arc::new(SimulatedEngine::new(
        workload.platform.stall_rate,
    )));
    controller.set_active(true);

    let boot = async {
        tokio::time::sleep(workload.boot_delay).await;
        services.gate.mark(BootPhase::FirstFrameRendered);
        services.gate.set_foreground(true);
        pager.refresh();
    };

    let scroll = async {
        let mut durations = Vec::new();
        let mut outcomes = Vec::new();
        for position in 0..pager.len() {
            if Instant::now() >= deadline {
                break;
            }
            pager.on_position_changed(position);
            let Some(item) = pager.item(position) else {
                break;
            };
            if item.kind == MediaKind::Image {
                tokio::time::sleep(workload.dwell).await;
                continue;
            }

            let assigned = Instant::now();
            controller.assign(item.id.clone());
            let outcome = wait_for_outcome(&controller, &mut events, &item.id).await;
            if matches!(outcome, Outcome::Ready(_)) {
                durations.push(assigned.elapsed());
                tokio::time::sleep(workload.dwell).await;
            }
            outcomes.push(outcome);
        }
        (durations, outcomes)
    };

    let (_, (durations, outcomes)) = tokio::join!(boot, scroll);

    controller.cancel();
    starting.abort();
    services.orchestrator.stop_all().await;

    let mut report = report.lock().unwrap_or_else(PoisonError::into_inner);
    report.sessions += 1;
    for duration in durations {
        report.time_to_ready.add(duration.as_secs_f64());
    }
    for outcome in outcomes {
        match outcome {
            Outcome::Ready(path) => {
                let path = path.map_or("unknown", LoadPath::as_str);
                *report.paths.entry(path).or_default() += 1;
            }
            Outcome::Failed => report.failed += 1,
            Outcome::TimedOut => report.timed_out += 1,
        }
    }
    report.requests += platform.requests();
    report.cancelled_requests += platform.cancelled();
    report.background_starts += background.starts.load(Ordering::Relaxed);
    report.ready_stats.push(services.ready.stats());
}

async fn wait_for_outcome(
    controller: &PlaybackController,
    events: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
    id: &ResourceId,
) -> Outcome {
    let timeout = Instant::now() + ITEM_TIMEOUT;
    loop {
        let event = match tokio::time::timeout_at(timeout, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Outcome::Failed,
            Err(_) => {
                tracing::warn!(resource = %id, "Item did not become ready in time");
                return Outcome::TimedOut;
            }
        };
        if event.resource != *id {
            continue;
        }
        match event.kind {
            EventKind::ItemReady => return Outcome::Ready(event.path),
            // Caches report failed prefetches too; only a failed controller counts.
            EventKind::Failed if controller.state() == PlaybackState::Failed => {
                return Outcome::Failed;
            }
            _ => {}
        }
    }
}
