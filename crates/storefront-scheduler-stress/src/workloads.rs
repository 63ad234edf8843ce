use std::time::Duration;

use serde::Deserialize;
use storefront_scheduler::OperationKind;
use storefront_scheduler::caching::{CacheKey, CacheName};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A synthetic stream of backend calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    pub name: String,
    pub concurrency: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub kind: OperationKind,
    /// Deduplicate the calls through this cache.
    #[serde(default)]
    pub cache: Option<CacheName>,
    /// How many different requests the workload cycles through.
    #[serde(default = "default_distinct_keys")]
    pub distinct_keys: usize,
    /// Average latency of the simulated backend.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a call failing, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// Route the calls through a debouncer.
    #[serde(default)]
    pub debounce: Option<Debounce>,
}

/// Debounce setting of a [`Workload`], either `true` or an explicit delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Debounce {
    /// Whether to debounce with the configured `debounce_delay`.
    Enabled(bool),
    Delay(#[serde(with = "humantime_serde")] Duration),
}

fn default_distinct_keys() -> usize {
    1
}

impl Workload {
    /// The url of the `index`th request of this workload.
    pub fn url(&self, index: usize) -> String {
        format!("/{}/{index}", self.name)
    }

    /// The debounce delay of this workload, falling back to `default` for `debounce: true`.
    pub fn debounce_delay(&self, default: Duration) -> Option<Duration> {
        match self.debounce? {
            Debounce::Enabled(true) => Some(default),
            Debounce::Enabled(false) => None,
            Debounce::Delay(delay) => Some(delay),
        }
    }

    pub fn cache_key(&self, index: usize) -> Option<CacheKey> {
        let cache = self.cache?;
        Some(CacheKey::for_request(cache, "GET", &self.url(index), None))
    }
}
