use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "reelwarm".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing and wait budget of one resource cache.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResourceCacheConfig {
    /// Maximum number of cached entries.
    ///
    /// Entries are evicted in approximate LRU order once the capacity is reached.
    pub capacity: u64,
    /// How long a playback controller waits on this cache before trying the next load path.
    pub wait_timeout: Duration,
}

/// A [`ResourceCacheConfig`] as written in the config file, where every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialResourceCacheConfig {
    capacity: Option<u64>,
    #[serde(with = "humantime_serde")]
    wait_timeout: Option<Duration>,
}

impl PartialResourceCacheConfig {
    fn or(self, defaults: ResourceCacheConfig) -> ResourceCacheConfig {
        ResourceCacheConfig {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            wait_timeout: self.wait_timeout.unwrap_or(defaults.wait_timeout),
        }
    }
}

/// The `caches` section as written in the config file.
///
/// The two caches have different defaults, so missing fields are filled in per cache from
/// [`CacheConfigs::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialCacheConfigs {
    coarse: PartialResourceCacheConfig,
    ready: PartialResourceCacheConfig,
    #[serde(with = "humantime_serde")]
    transient_backoff: Option<Duration>,
}

impl From<PartialCacheConfigs> for CacheConfigs {
    fn from(partial: PartialCacheConfigs) -> Self {
        let defaults = CacheConfigs::default();
        Self {
            coarse: partial.coarse.or(defaults.coarse),
            ready: partial.ready.or(defaults.ready),
            transient_backoff: partial
                .transient_backoff
                .unwrap_or(defaults.transient_backoff),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "PartialCacheConfigs")]
pub struct CacheConfigs {
    /// The cache of raw, reusable resources.
    pub coarse: ResourceCacheConfig,
    /// The cache of single-use playable items.
    pub ready: ResourceCacheConfig,
    /// How long prefetching skips a resource after a transient platform failure.
    pub transient_backoff: Duration,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            coarse: ResourceCacheConfig {
                capacity: 64,
                wait_timeout: Duration::from_millis(450),
            },
            ready: ResourceCacheConfig {
                capacity: 24,
                wait_timeout: Duration::from_millis(800),
            },
            transient_backoff: Duration::from_secs(10),
        }
    }
}

/// The prefetch window around the current feed position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of items behind the current position to keep warm.
    pub lookbehind: usize,
    /// Number of items ahead of the current position to keep warm.
    pub lookahead: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lookbehind: 1,
            lookahead: 8,
        }
    }
}

/// Bounds on the boot-time waits.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BootConfig {
    /// How long the bootstrapper waits for the app to become foreground-active before fetching
    /// anyway.
    #[serde(with = "humantime_serde")]
    pub foreground_wait: Duration,
    /// How long a gated service waits for the first content to be ready before starting anyway.
    #[serde(with = "humantime_serde")]
    pub first_content_wait: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            foreground_wait: Duration::from_secs(30),
            first_content_wait: Duration::from_secs(600),
        }
    }
}

/// Tuning of the playback position sampler and stall detection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How often the playback position is sampled.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// How long the position may stand still while playing before a stall is reported.
    #[serde(with = "humantime_serde")]
    pub stall_threshold: Duration,
    /// Position changes up to this amount count as standing still.
    #[serde(with = "humantime_serde")]
    pub stall_tolerance: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(300),
            stall_threshold: Duration::from_secs(1),
            stall_tolerance: Duration::from_millis(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Sizing of the resource caches.
    pub caches: CacheConfigs,

    /// The prefetch window.
    pub prefetch: PrefetchConfig,

    /// Boot-time waits.
    pub boot: BootConfig,

    /// Position sampling and stall detection.
    pub playback: PlaybackConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.transient_backoff, Duration::from_secs(10));
        assert_eq!(cfg.caches.ready.wait_timeout, Duration::from_millis(800));
        assert_eq!(cfg.caches.coarse.wait_timeout, Duration::from_millis(450));
        assert_eq!(cfg.prefetch.lookbehind, 1);
        assert_eq!(cfg.prefetch.lookahead, 8);
        assert_eq!(cfg.boot.foreground_wait, Duration::from_secs(30));
        assert_eq!(cfg.boot.first_content_wait, Duration::from_secs(600));
        assert_eq!(cfg.playback.stall_threshold, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_cache_config() {
        // Setting one cache must not affect the other cache's defaults.
        let yaml = r#"
            caches:
              ready:
                wait_timeout: 1s
              transient_backoff: 2m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let defaults = CacheConfigs::default();
        assert_eq!(cfg.caches.ready.wait_timeout, Duration::from_secs(1));
        assert_eq!(cfg.caches.ready.capacity, defaults.ready.capacity);
        assert_eq!(cfg.caches.coarse, defaults.coarse);
        assert_eq!(cfg.caches.transient_backoff, Duration::from_secs(120));
    }

    #[test]
    fn test_partial_resource_cache_config() {
        let yaml = r#"
            caches:
              coarse:
                capacity: 8
              ready:
                capacity: 4
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let defaults = CacheConfigs::default();
        assert_eq!(cfg.caches.coarse.capacity, 8);
        assert_eq!(cfg.caches.coarse.wait_timeout, defaults.coarse.wait_timeout);
        assert_eq!(cfg.caches.ready.capacity, 4);
        assert_eq!(cfg.caches.ready.wait_timeout, defaults.ready.wait_timeout);
        assert_eq!(cfg.caches.transient_backoff, defaults.transient_backoff);

        let yaml = r#"
            caches: {}
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches, defaults);
    }

    #[test]
    fn test_prefetch_and_playback() {
        let yaml = r#"
            prefetch:
              lookahead: 3
            playback:
              sample_interval: 100ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.prefetch.lookahead, 3);
        assert_eq!(cfg.prefetch.lookbehind, 1);
        assert_eq!(cfg.playback.sample_interval, Duration::from_millis(100));
        assert_eq!(cfg.playback.stall_tolerance, Duration::from_millis(30));
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                capacity: 10
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
