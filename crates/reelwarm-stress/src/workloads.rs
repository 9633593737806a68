use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

/// A group of identical feed sessions.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Workload {
    /// Number of sessions running at the same time.
    pub concurrency: usize,
    /// Number of items in the feed. Sessions wrap around at the end.
    pub feed_length: usize,
    /// Share of still images in the feed, between 0 and 1.
    pub image_ratio: f64,
    /// How long the user stays on an item once it is ready.
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// How long the app takes to render its first frame and become active.
    #[serde(with = "humantime_serde")]
    pub boot_delay: Duration,
    /// Behavior of the simulated media platform.
    pub platform: PlatformProfile,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            concurrency: 1,
            feed_length: 50,
            image_ratio: 0.1,
            dwell: Duration::from_millis(800),
            boot_delay: Duration::from_millis(300),
            platform: PlatformProfile::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlatformProfile {
    #[serde(with = "humantime_serde")]
    pub min_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    /// Share of requests failing with a transient error, between 0 and 1.
    pub transient_failure_rate: f64,
    /// Share of requests failing for good, between 0 and 1.
    pub permanent_failure_rate: f64,
    /// Share of playback positions that stand still, simulating a stall.
    pub stall_rate: f64,
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(50),
            max_latency: Duration::from_millis(600),
            transient_failure_rate: 0.02,
            permanent_failure_rate: 0.005,
            stall_rate: 0.0,
        }
    }
}
