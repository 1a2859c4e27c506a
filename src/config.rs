//! # Configuration Module
//!
//! Runtime options for a [`Mediator`](crate::Mediator).
//!
//! Configuration comes from code (`MediatorConfig::default()` plus `with_*`
//! setters), from environment variables, or from a YAML file. All three end in
//! the same [`MediatorConfig`], which is checked with
//! [`validate`](MediatorConfig::validate) before any thread is spawned.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `BRRTM_CAPACITY` | `1024` | ring slots per lane |
//! | `BRRTM_CONSUMER_THREADS` | `1` | lanes, each with one consumer thread |
//! | `BRRTM_WAIT_STRATEGY` | `yielding` | `busy-spin`, `yielding`, `timed-park` |
//! | `BRRTM_BACKPRESSURE_MODE` | `block` | `block` or `shed` |
//! | `BRRTM_CLAIM_TIMEOUT_MS` | `1000` | max wait for a free slot, `0` = unbounded |
//! | `BRRTM_DISPATCH_TIMEOUT_MS` | `30000` | max blocking wait for a result, `0` = unbounded |
//! | `BRRTM_PARK_INTERVAL_US` | `100` | park duration for `timed-park` |
//! | `BRRTM_ASYNC_FAILURES` | `log` | `log` or `discard` |
//!
//! Unparsable values fall back to the default.
//!
//! ## YAML
//!
//! ```yaml
//! capacity: 4096
//! consumer_threads: 2
//! wait_strategy: timed-park
//! backpressure: shed
//! claim_timeout_ms: 0
//! dispatch_timeout_ms: 5000
//! park_interval_us: 50
//! async_failures: discard
//! thread_name_prefix: orders
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::ring::WaitStrategy;

/// What a producer does when its lane's ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureMode {
    /// Wait for a free slot (bounded by `claim_timeout`), then fail with `Capacity`
    #[default]
    Block,
    /// Fail with `Capacity` immediately
    Shed,
}

impl BackpressureMode {
    /// Parse backpressure mode from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "shed" => Some(Self::Shed),
            _ => None,
        }
    }
}

/// What happens to handler failures nobody is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncFailurePolicy {
    /// Drop silently (still counted in metrics)
    Discard,
    /// Emit a `warn!` with the dispatch id and error
    #[default]
    Log,
}

impl AsyncFailurePolicy {
    /// Parse policy from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "discard" | "drop" | "silent" => Some(Self::Discard),
            "log" | "warn" => Some(Self::Log),
            _ => None,
        }
    }
}

/// Mediator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Ring slots per lane (positive; power of two recommended)
    pub capacity: usize,
    /// Number of lanes, each served by one consumer thread
    pub consumer_threads: usize,
    /// Idle strategy for all suspension points
    pub wait_strategy: WaitStrategy,
    /// Full-ring policy
    pub backpressure: BackpressureMode,
    /// Bound on waiting for a free slot in `Block` mode (`None` = unbounded)
    pub claim_timeout: Option<Duration>,
    /// Default bound on a blocking dispatch's wait for its result (`None` = unbounded)
    pub dispatch_timeout: Option<Duration>,
    /// Park duration used by [`WaitStrategy::TimedPark`]
    pub park_interval: Duration,
    /// Visibility of fire-and-forget failures
    pub async_failure_policy: AsyncFailurePolicy,
    /// Consumer threads are named `{prefix}-{lane}`
    pub thread_name_prefix: String,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            consumer_threads: 1,
            wait_strategy: WaitStrategy::Yielding,
            backpressure: BackpressureMode::Block,
            claim_timeout: Some(Duration::from_secs(1)),
            dispatch_timeout: Some(Duration::from_secs(30)),
            park_interval: Duration::from_micros(100),
            async_failure_policy: AsyncFailurePolicy::Log,
            thread_name_prefix: "brrtm-lane".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(key, value = %raw, "Ignoring unparsable environment variable");
    }
    parsed
}

fn env_with<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "Ignoring unrecognised environment variable");
    }
    parsed
}

/// `0` means unbounded
fn millis_bound(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn bound_millis(bound: Option<Duration>) -> u64 {
    bound.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl MediatorConfig {
    /// Load configuration from `BRRTM_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let claim_timeout = env_parse::<u64>("BRRTM_CLAIM_TIMEOUT_MS")
            .map_or(defaults.claim_timeout, millis_bound);
        let dispatch_timeout = env_parse::<u64>("BRRTM_DISPATCH_TIMEOUT_MS")
            .map_or(defaults.dispatch_timeout, millis_bound);

        let config = Self {
            capacity: env_parse("BRRTM_CAPACITY").unwrap_or(defaults.capacity),
            consumer_threads: env_parse("BRRTM_CONSUMER_THREADS")
                .unwrap_or(defaults.consumer_threads),
            wait_strategy: env_with("BRRTM_WAIT_STRATEGY", WaitStrategy::from_str)
                .unwrap_or(defaults.wait_strategy),
            backpressure: env_with("BRRTM_BACKPRESSURE_MODE", BackpressureMode::from_str)
                .unwrap_or(defaults.backpressure),
            claim_timeout,
            dispatch_timeout,
            park_interval: env_parse::<u64>("BRRTM_PARK_INTERVAL_US")
                .map_or(defaults.park_interval, Duration::from_micros),
            async_failure_policy: env_with("BRRTM_ASYNC_FAILURES", AsyncFailurePolicy::from_str)
                .unwrap_or(defaults.async_failure_policy),
            thread_name_prefix: defaults.thread_name_prefix,
        };
        debug!(?config, "Loaded mediator configuration from environment");
        config
    }

    /// Parse a YAML document; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Loaded mediator configuration file");
        Self::from_yaml_str(&contents)
    }

    /// Render as YAML (the same shape [`from_yaml_str`](Self::from_yaml_str) reads)
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&ConfigFile::from(self))?)
    }

    /// Reject configurations the mediator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }
        if self.consumer_threads == 0 {
            return Err(ConfigError::InvalidConsumerThreads(self.consumer_threads));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "thread_name_prefix",
                value: String::new(),
            });
        }
        if !self.capacity.is_power_of_two() {
            warn!(
                capacity = self.capacity,
                "Ring capacity is not a power of two; slot indexing falls back to modulo"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_consumer_threads(mut self, consumer_threads: usize) -> Self {
        self.consumer_threads = consumer_threads;
        self
    }

    #[must_use]
    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    #[must_use]
    pub fn with_backpressure(mut self, backpressure: BackpressureMode) -> Self {
        self.backpressure = backpressure;
        self
    }

    #[must_use]
    pub fn with_claim_timeout(mut self, claim_timeout: Option<Duration>) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    #[must_use]
    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Option<Duration>) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }

    #[must_use]
    pub fn with_park_interval(mut self, park_interval: Duration) -> Self {
        self.park_interval = park_interval;
        self
    }

    #[must_use]
    pub fn with_async_failure_policy(mut self, policy: AsyncFailurePolicy) -> Self {
        self.async_failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// On-disk shape: durations as integers
#[derive(Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    capacity: usize,
    consumer_threads: usize,
    wait_strategy: WaitStrategy,
    backpressure: BackpressureMode,
    claim_timeout_ms: u64,
    dispatch_timeout_ms: u64,
    park_interval_us: u64,
    async_failures: AsyncFailurePolicy,
    thread_name_prefix: String,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::from(&MediatorConfig::default())
    }
}

impl From<&MediatorConfig> for ConfigFile {
    fn from(config: &MediatorConfig) -> Self {
        Self {
            capacity: config.capacity,
            consumer_threads: config.consumer_threads,
            wait_strategy: config.wait_strategy,
            backpressure: config.backpressure,
            claim_timeout_ms: bound_millis(config.claim_timeout),
            dispatch_timeout_ms: bound_millis(config.dispatch_timeout),
            park_interval_us: u64::try_from(config.park_interval.as_micros()).unwrap_or(u64::MAX),
            async_failures: config.async_failure_policy,
            thread_name_prefix: config.thread_name_prefix.clone(),
        }
    }
}

impl From<ConfigFile> for MediatorConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            capacity: file.capacity,
            consumer_threads: file.consumer_threads,
            wait_strategy: file.wait_strategy,
            backpressure: file.backpressure,
            claim_timeout: millis_bound(file.claim_timeout_ms),
            dispatch_timeout: millis_bound(file.dispatch_timeout_ms),
            park_interval: Duration::from_micros(file.park_interval_us),
            async_failure_policy: file.async_failures,
            thread_name_prefix: file.thread_name_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_mode_from_str() {
        assert_eq!(
            BackpressureMode::from_str("block"),
            Some(BackpressureMode::Block)
        );
        assert_eq!(
            BackpressureMode::from_str("SHED"),
            Some(BackpressureMode::Shed)
        );
        assert_eq!(BackpressureMode::from_str("drop"), None);
    }

    #[test]
    fn test_async_failure_policy_from_str() {
        assert_eq!(
            AsyncFailurePolicy::from_str("discard"),
            Some(AsyncFailurePolicy::Discard)
        );
        assert_eq!(
            AsyncFailurePolicy::from_str("Log"),
            Some(AsyncFailurePolicy::Log)
        );
        assert_eq!(AsyncFailurePolicy::from_str("panic"), None);
    }

    #[test]
    fn test_mediator_config_default() {
        let config = MediatorConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.consumer_threads, 1);
        assert_eq!(config.wait_strategy, WaitStrategy::Yielding);
        assert_eq!(config.backpressure, BackpressureMode::Block);
        assert_eq!(config.claim_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.dispatch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.park_interval, Duration::from_micros(100));
        assert_eq!(config.async_failure_policy, AsyncFailurePolicy::Log);
        assert_eq!(config.thread_name_prefix, "brrtm-lane");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let err = MediatorConfig::default().with_capacity(0).validate();
        assert!(matches!(err, Err(ConfigError::InvalidCapacity(0))));

        let err = MediatorConfig::default()
            .with_consumer_threads(0)
            .validate();
        assert!(matches!(err, Err(ConfigError::InvalidConsumerThreads(0))));

        let err = MediatorConfig::default()
            .with_thread_name_prefix("")
            .validate();
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue {
                key: "thread_name_prefix",
                ..
            })
        ));
    }

    #[test]
    fn test_non_power_of_two_capacity_is_accepted() {
        assert!(MediatorConfig::default()
            .with_capacity(1000)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_from_yaml_str_partial() {
        let config = MediatorConfig::from_yaml_str(
            "capacity: 64\nwait_strategy: timed-park\nbackpressure: shed\nclaim_timeout_ms: 0\n",
        )
        .unwrap();
        assert_eq!(config.capacity, 64);
        assert_eq!(config.wait_strategy, WaitStrategy::TimedPark);
        assert_eq!(config.backpressure, BackpressureMode::Shed);
        assert_eq!(config.claim_timeout, None);
        // Untouched keys keep their defaults.
        assert_eq!(config.consumer_threads, 1);
        assert_eq!(config.dispatch_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_yaml_str_rejects_unknown_keys_and_invalid_values() {
        assert!(matches!(
            MediatorConfig::from_yaml_str("capacity: 8\nring_size: 16\n"),
            Err(ConfigError::Yaml(_))
        ));
        assert!(matches!(
            MediatorConfig::from_yaml_str("capacity: 0\n"),
            Err(ConfigError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_yaml_round_trip_preserves_unbounded_timeouts() {
        let config = MediatorConfig::default()
            .with_capacity(256)
            .with_dispatch_timeout(None)
            .with_async_failure_policy(AsyncFailurePolicy::Discard);
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(MediatorConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
