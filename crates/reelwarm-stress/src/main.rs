//! Simulated feed sessions against the media readiness pipeline.
//!
//! Every session boots a fresh set of pipeline services on top of a simulated media platform,
//! scrolls through a feed with a playback controller on the centered cell, and records how long
//! each item took to become ready.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use reelwarm_service::config::Config;

mod logging;
mod simulation;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = workloads::WorkloadsConfig::from_path(&cli.workloads)?;
    let service_config = Config::get(cli.config.as_deref())?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: service_config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        traces_sample_rate: 1.0,
        ..Default::default()
    });

    // SAFETY: No other threads are running yet.
    unsafe { logging::init_logging(&service_config) };

    if let Some(statsd) = &service_config.metrics.statsd {
        reelwarm_service::metrics::configure_statsd(
            &service_config.metrics.prefix,
            statsd.as_str(),
            service_config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(stresstest::perform_stresstest(
        service_config,
        workloads,
        cli.duration,
    ))
}
