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

use crate::caching::CacheName;
use crate::types::OperationKind;

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
    /// The log level for the scheduler.
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
            prefix: "storefront_scheduler".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Default timeouts per [`OperationKind`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CallTimeouts {
    /// Timeout for side-effect free lookups.
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    /// Timeout for cart and checkout mutations.
    ///
    /// The backend performs multi-step side effects for these, so they must not be cut short.
    #[serde(with = "humantime_serde")]
    pub mutation: Duration,
}

impl CallTimeouts {
    pub fn for_kind(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::Read => self.read,
            OperationKind::Mutation => self.mutation,
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            mutation: Duration::from_secs(45),
        }
    }
}

/// Expiry and size bound of a single in-memory cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheConfig {
    /// How long a completed result is served before it is fetched again.
    pub ttl: Duration,
    /// The maximum number of entries. The oldest completed entry is evicted beyond that.
    pub capacity: usize,
}

impl CacheConfig {
    const fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity }
    }

    fn merge(self, overrides: CacheOverrides) -> Self {
        Self {
            ttl: overrides.ttl.unwrap_or(self.ttl),
            capacity: overrides.capacity.unwrap_or(self.capacity),
        }
    }
}

/// The fields of a [`CacheConfig`] as written in the config file.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
struct CacheOverrides {
    #[serde(with = "humantime_serde")]
    ttl: Option<Duration>,
    capacity: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
struct CacheConfigOverrides {
    categories: CacheOverrides,
    catalog: CacheOverrides,
    listings: CacheOverrides,
    content: CacheOverrides,
}

/// Struct to treat all cache configs identical in cache code.
///
/// Every call class gets its own TTL and capacity. Settings missing from the config file keep
/// their per-class default.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "CacheConfigOverrides")]
pub struct CacheConfigs {
    /// The category tree, which rarely changes.
    pub categories: CacheConfig,
    /// Single product lookups.
    pub catalog: CacheConfig,
    /// Filtered product listings.
    pub listings: CacheConfig,
    /// CMS driven page content.
    pub content: CacheConfig,
}

impl From<CacheConfigOverrides> for CacheConfigs {
    fn from(overrides: CacheConfigOverrides) -> Self {
        let defaults = Self::default();
        Self {
            categories: defaults.categories.merge(overrides.categories),
            catalog: defaults.catalog.merge(overrides.catalog),
            listings: defaults.listings.merge(overrides.listings),
            content: defaults.content.merge(overrides.content),
        }
    }
}

impl CacheConfigs {
    pub fn get(&self, name: CacheName) -> &CacheConfig {
        match name {
            CacheName::Categories => &self.categories,
            CacheName::Catalog => &self.catalog,
            CacheName::Listings => &self.listings,
            CacheName::Content => &self.content,
        }
    }
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            categories: CacheConfig::new(Duration::from_secs(5 * 60), 64),
            catalog: CacheConfig::new(Duration::from_secs(60), 512),
            listings: CacheConfig::new(Duration::from_secs(30), 256),
            content: CacheConfig::new(Duration::from_secs(10 * 60), 128),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Default timeouts for reads and mutations.
    pub timeouts: CallTimeouts,

    /// Per call class cache settings.
    pub caches: CacheConfigs,

    /// Default trailing delay for filter-driven calls.
    #[serde(with = "humantime_serde")]
    pub debounce_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            timeouts: CallTimeouts::default(),
            caches: CacheConfigs::default(),
            debounce_delay: Duration::from_millis(300),
        }
    }
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

/// The part of the [`Config`] a [`Scheduler`](crate::Scheduler) needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub timeouts: CallTimeouts,
    pub caches: CacheConfigs,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeouts: config.timeouts,
            caches: config.caches,
        }
    }
}

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
