//! Configuration of the cache and its ambient services.
//!
//! The [`Config`] is usually read from a YAML file, with all durations given in a
//! human-readable format:
//!
//! ```yaml
//! cache:
//!   ttl: 10m
//!   refresh_threshold: 1m
//!   max_background_refreshes: 32
//! memory:
//!   max_capacity: 100000
//! logging:
//!   level: debug
//! ```
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::stores::{MemoryStore, MemoryStoreConfig};

/// Configuration of a [`TieredCache`](crate::TieredCache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The TTL used for writes that do not specify one.
    ///
    /// Without a default TTL, such entries never expire on their own.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// The refresh threshold used by `wrap` calls that do not specify one.
    ///
    /// A cached value that has less than this time left to live is served, and refreshed in
    /// the background.
    #[serde(with = "humantime_serde")]
    pub refresh_threshold: Option<Duration>,

    /// Maximum number of background refreshes running at the same time.
    ///
    /// Stale values are still served when this limit is reached, but no refresh is started
    /// for them. Unlimited when unset.
    pub max_background_refreshes: Option<usize>,

    /// The number of events buffered for each subscriber.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            refresh_threshold: None,
            max_background_refreshes: None,
            event_capacity: 256,
        }
    }
}

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
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
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
            prefix: "tiercache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The complete configuration of an application using the cache.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Defaults for the tiered cache.
    pub cache: CacheConfig,
    /// Settings of the in-process memory tier.
    pub memory: MemoryStoreConfig,
    /// Configuration for internal logging.
    pub logging: Logging,
    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Config {
    /// Reads the config from `path`, or returns the defaults if no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    /// Creates an empty [`MemoryStore`] with the configured capacity.
    pub fn memory_store<V>(&self) -> MemoryStore<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        MemoryStore::new(self.memory.clone())
    }

    /// Parses the YAML config from `reader`.
    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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
