//! Structured logging setup
//!
//! Every component logs through `tracing` with structured fields
//! (`dispatch_id`, `lane`, `sequence`, `request_type`, `latency_us`). This
//! module installs the subscriber that renders them:
//! - JSON for production, pretty-print for development
//! - Sampling of the per-dispatch `debug!`/`trace!` events so they can stay
//!   enabled under load without drowning lifecycle and failure events
//! - Async buffered output through `tracing-appender`
//!
//! The library never installs a subscriber on its own; binaries call
//! [`init_logging`] or [`init_logging_with_config`].
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `BRRTM_LOG_LEVEL` | `info` | base level |
//! | `BRRTM_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `BRRTM_LOG_SAMPLING_MODE` | `all` | `all`, `error-only`, `sampled` |
//! | `BRRTM_LOG_SAMPLING_RATE` | `0.1` | fraction of dispatch events kept when `sampled` |
//! | `BRRTM_LOG_ASYNC` | `true` | non-blocking stdout writer |
//! | `BRRTM_LOG_TARGET_FILTER` | unset | extra directives, e.g. `brrtmediator::ring=trace` |
//! | `BRRTM_LOG_INCLUDE_LOCATION` | `false` | file and line in each record |

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{Level, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Which events survive the sampling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingMode {
    /// Keep everything the filter lets through
    #[default]
    All,
    /// Keep warnings and errors only
    ErrorOnly,
    /// Keep info and above, thin out debug/trace dispatch events
    Sampled,
}

impl SamplingMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Some(Self::All),
            "error-only" | "error_only" | "errors" => Some(Self::ErrorOnly),
            "sampled" | "sample" => Some(Self::Sampled),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// trace/debug/info/warn/error; `RUST_LOG` takes precedence when set
    pub log_level: String,
    pub format: LogFormat,
    pub sampling_mode: SamplingMode,
    /// Fraction (0.0-1.0) of debug/trace events kept in `Sampled` mode
    pub sampling_rate: f64,
    /// Write through a background thread instead of locking stdout per line
    pub async_logging: bool,
    /// Extra filter directives, comma-separated
    pub target_filter: Option<String>,
    /// Include file:line in each record
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            sampling_mode: SamplingMode::All,
            sampling_rate: 0.1,
            async_logging: true,
            target_filter: None,
            include_location: false,
        }
    }
}

fn env_value<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    env::var(key).ok().and_then(|raw| parse(&raw))
}

impl LogConfig {
    /// Read `BRRTM_LOG_*`; missing or unparsable values keep their defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_level: env::var("BRRTM_LOG_LEVEL").unwrap_or(defaults.log_level),
            format: env_value("BRRTM_LOG_FORMAT", LogFormat::from_str).unwrap_or(defaults.format),
            sampling_mode: env_value("BRRTM_LOG_SAMPLING_MODE", SamplingMode::from_str)
                .unwrap_or(defaults.sampling_mode),
            sampling_rate: env_value("BRRTM_LOG_SAMPLING_RATE", |s| s.trim().parse().ok())
                .unwrap_or(defaults.sampling_rate),
            async_logging: env_value("BRRTM_LOG_ASYNC", |s| s.trim().parse().ok())
                .unwrap_or(defaults.async_logging),
            target_filter: env::var("BRRTM_LOG_TARGET_FILTER").ok(),
            include_location: env_value("BRRTM_LOG_INCLUDE_LOCATION", |s| s.trim().parse().ok())
                .unwrap_or(defaults.include_location),
        }
    }

    /// Every event, synchronous pretty output with locations
    pub fn development() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            async_logging: false,
            include_location: true,
            ..Self::default()
        }
    }

    /// Sampled JSON through the non-blocking writer
    pub fn production() -> Self {
        Self {
            sampling_mode: SamplingMode::Sampled,
            ..Self::default()
        }
    }
}

/// Drops events according to [`SamplingMode`].
///
/// In `Sampled` mode one in `1 / rate` debug/trace events is kept, counted
/// across all lanes; info and above always pass.
pub struct SamplingLayer {
    mode: SamplingMode,
    /// `None` drops every sampled-out event
    keep_every: Option<u64>,
    seen: AtomicU64,
}

impl SamplingLayer {
    pub fn new(mode: SamplingMode, rate: f64) -> Self {
        let rate = rate.clamp(0.0, 1.0);
        let keep_every = (rate > 0.0).then(|| (1.0 / rate).round().max(1.0) as u64);
        Self {
            mode,
            keep_every,
            seen: AtomicU64::new(0),
        }
    }

    fn keeps(&self, level: Level) -> bool {
        match self.mode {
            SamplingMode::All => true,
            SamplingMode::ErrorOnly => level <= Level::WARN,
            SamplingMode::Sampled if level <= Level::INFO => true,
            SamplingMode::Sampled => self
                .keep_every
                .is_some_and(|every| self.seen.fetch_add(1, Ordering::Relaxed) % every == 0),
        }
    }
}

impl<S> Layer<S> for SamplingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: LayerContext<'_, S>) -> bool {
        // Spans carry no dispatch payload; only events are thinned.
        !metadata.is_event() || self.keeps(*metadata.level())
    }
}

/// Keeps the async writer's worker alive; drop it last to flush buffered lines.
#[must_use = "dropping the guard stops async log output"]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = config.log_level.trim().to_lowercase();
    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&base))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let directives = config.target_filter.as_deref().unwrap_or_default();
    for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            // No subscriber exists yet to report through.
            Err(err) => eprintln!("brrtmediator: ignoring log directive {directive:?}: {err}"),
        }
    }
    filter
}

/// [`LogConfig::from_env`] with `log_level` overridden
///
/// # Example
///
/// ```no_run
/// use brrtmediator::logging;
///
/// let _guard = logging::init_logging("debug").expect("logging");
/// ```
pub fn init_logging(log_level: &str) -> Result<LoggingGuard> {
    init_logging_with_config(&LogConfig {
        log_level: log_level.to_string(),
        ..LogConfig::from_env()
    })
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging_with_config(config: &LogConfig) -> Result<LoggingGuard> {
    let (writer, worker) = if config.async_logging {
        let (non_blocking, worker) = tracing_appender::non_blocking(std::io::stdout());
        (BoxMakeWriter::new(non_blocking), Some(worker))
    } else {
        (BoxMakeWriter::new(std::io::stdout), None)
    };

    // Lane threads are named, so the thread name identifies the consumer.
    let output = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_writer(writer);
    let output = match config.format {
        LogFormat::Json => output.json().flatten_event(true).boxed(),
        LogFormat::Pretty => output.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(SamplingLayer::new(config.sampling_mode, config.sampling_rate))
        .with(output)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _worker: worker })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.format, LogFormat::Pretty);
        assert_eq!(dev.sampling_mode, SamplingMode::All);
        assert!(!dev.async_logging);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.sampling_mode, SamplingMode::Sampled);
        assert!(prod.async_logging && !prod.include_location);
    }

    #[test]
    fn test_from_str_variants() {
        assert_eq!(LogFormat::from_str(" Pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::from_str("xml"), None);
        assert_eq!(SamplingMode::from_str("error_only"), Some(SamplingMode::ErrorOnly));
        assert_eq!(SamplingMode::from_str("SAMPLED"), Some(SamplingMode::Sampled));
        assert_eq!(SamplingMode::from_str("most"), None);
    }

    #[test]
    fn test_error_only_keeps_warnings() {
        let layer = SamplingLayer::new(SamplingMode::ErrorOnly, 1.0);
        assert!(!layer.keeps(Level::INFO));
        assert!(layer.keeps(Level::WARN));
        assert!(layer.keeps(Level::ERROR));
    }

    #[test]
    fn test_sampled_thins_dispatch_events_only() {
        let layer = SamplingLayer::new(SamplingMode::Sampled, 0.25);
        let kept = (0..100).filter(|_| layer.keeps(Level::DEBUG)).count();
        assert_eq!(kept, 25);
        assert!((0..10).all(|_| layer.keeps(Level::INFO)));
    }

    #[test]
    fn test_zero_rate_drops_all_dispatch_events() {
        let layer = SamplingLayer::new(SamplingMode::Sampled, -3.0);
        assert!(!layer.keeps(Level::TRACE));
        assert!(layer.keeps(Level::ERROR));
    }
}
