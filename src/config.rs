//! Oracle configuration.
//!
//! Read once at startup from `ORACLE_*` environment variables (a `.env` file
//! is honoured by the binary). Nothing is hot-reloaded: an invalid value
//! stops the oracle before its first cycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use consensus_oracle_core::sources::{NavEntry, PythFeed, HERMES_URL, NAV_SOURCE};
use consensus_oracle_core::{
    BreakerConfig, OracleError, TwapWindows, DEFAULT_DEVIATION_THRESHOLD, DEFAULT_MAX_ALERTS,
    DEFAULT_MIN_SOURCES, DEFAULT_RECOVERY_WINDOW_SECS, DEFAULT_STALENESS_SECS,
};

/// Default cycle interval in seconds.
pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 30;

/// Default per-source fetch timeout in seconds.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 10;

/// Default timeout for persistence and settlement calls, in seconds.
pub const DEFAULT_SINK_TIMEOUT_SECS: u64 = 5;

/// Invalid or unparsable configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: String, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl From<ConfigError> for OracleError {
    fn from(err: ConfigError) -> Self {
        OracleError::Configuration(err.to_string())
    }
}

/// Everything the oracle needs to know at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleConfig {
    /// Relative move from the last trusted price that trips a breaker
    pub deviation_threshold: f64,

    /// How long a tripped breaker stays tripped
    pub recovery_window_secs: i64,

    /// Minimum sources behind a trusted price
    pub min_sources: usize,

    /// Maximum quote age eligible for aggregation
    pub staleness_secs: i64,

    pub twap_windows: TwapWindows,

    pub cycle_interval: Duration,
    pub source_timeout: Duration,
    pub sink_timeout: Duration,

    /// Alert log capacity
    pub max_alerts: usize,

    pub hermes_url: String,

    /// Pyth feeds polled (and streamed) each cycle
    pub pyth_feeds: Vec<PythFeed>,

    /// Follow the Hermes SSE stream in addition to polling
    pub pyth_stream: bool,

    /// Curated NAV prices seeded into the NAV table
    pub nav_prices: Vec<(String, NavEntry)>,

    /// CSV file receiving every published price, if set
    pub price_log: Option<PathBuf>,

    /// Push aggregated prices to the settlement layer
    pub settlement_sync: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: DEFAULT_DEVIATION_THRESHOLD,
            recovery_window_secs: DEFAULT_RECOVERY_WINDOW_SECS,
            min_sources: DEFAULT_MIN_SOURCES,
            staleness_secs: DEFAULT_STALENESS_SECS,
            twap_windows: TwapWindows::default(),
            cycle_interval: Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS),
            source_timeout: Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS),
            sink_timeout: Duration::from_secs(DEFAULT_SINK_TIMEOUT_SECS),
            max_alerts: DEFAULT_MAX_ALERTS,
            hermes_url: HERMES_URL.to_string(),
            pyth_feeds: PythFeed::all().to_vec(),
            pyth_stream: false,
            nav_prices: Vec::new(),
            price_log: None,
            settlement_sync: false,
        }
    }
}

impl OracleConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Load from an explicit variable map; unset variables keep their defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("ORACLE_DEVIATION_THRESHOLD") {
            config.deviation_threshold = parse("ORACLE_DEVIATION_THRESHOLD", v)?;
        }
        if let Some(v) = get("ORACLE_RECOVERY_WINDOW_SECS") {
            config.recovery_window_secs = parse("ORACLE_RECOVERY_WINDOW_SECS", v)?;
        }
        if let Some(v) = get("ORACLE_MIN_SOURCES") {
            config.min_sources = parse("ORACLE_MIN_SOURCES", v)?;
        }
        if let Some(v) = get("ORACLE_STALENESS_SECS") {
            config.staleness_secs = parse("ORACLE_STALENESS_SECS", v)?;
        }
        if let Some(v) = get("ORACLE_TWAP_WINDOWS") {
            config.twap_windows = parse_twap_windows(v)?;
        }
        if let Some(v) = get("ORACLE_CYCLE_INTERVAL_SECS") {
            config.cycle_interval = Duration::from_secs(parse("ORACLE_CYCLE_INTERVAL_SECS", v)?);
        }
        if let Some(v) = get("ORACLE_SOURCE_TIMEOUT_SECS") {
            config.source_timeout = Duration::from_secs(parse("ORACLE_SOURCE_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = get("ORACLE_SINK_TIMEOUT_SECS") {
            config.sink_timeout = Duration::from_secs(parse("ORACLE_SINK_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = get("ORACLE_MAX_ALERTS") {
            config.max_alerts = parse("ORACLE_MAX_ALERTS", v)?;
        }
        if let Some(v) = get("ORACLE_HERMES_URL") {
            config.hermes_url = v.to_string();
        }
        if let Some(v) = get("ORACLE_PYTH_STREAM") {
            config.pyth_stream = parse("ORACLE_PYTH_STREAM", v)?;
        }
        if let Some(v) = get("ORACLE_ASSETS") {
            config.pyth_feeds = parse_feeds(v)?;
        }
        if let Some(v) = get("ORACLE_NAV_PRICES") {
            config.nav_prices = parse_nav_prices(v)?;
        }
        if let Some(v) = get("ORACLE_PRICE_LOG") {
            config.price_log = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ORACLE_SETTLEMENT_SYNC") {
            config.settlement_sync = parse("ORACLE_SETTLEMENT_SYNC", v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.deviation_threshold > 0.0 && self.deviation_threshold < 1.0) {
            return Err(invalid(
                "ORACLE_DEVIATION_THRESHOLD",
                format!("must be in (0, 1), got {}", self.deviation_threshold),
            ));
        }
        if self.recovery_window_secs <= 0 {
            return Err(invalid("ORACLE_RECOVERY_WINDOW_SECS", "must be positive"));
        }
        if self.min_sources == 0 {
            return Err(invalid("ORACLE_MIN_SOURCES", "must be at least 1"));
        }
        if self.staleness_secs <= 0 {
            return Err(invalid("ORACLE_STALENESS_SECS", "must be positive"));
        }
        let w = self.twap_windows;
        if w.short_secs <= 0 || w.short_secs >= w.medium_secs || w.medium_secs >= w.long_secs {
            return Err(invalid(
                "ORACLE_TWAP_WINDOWS",
                "windows must be positive and strictly ascending",
            ));
        }
        if self.cycle_interval.is_zero() {
            return Err(invalid("ORACLE_CYCLE_INTERVAL_SECS", "must be positive"));
        }
        if self.source_timeout.is_zero() {
            return Err(invalid("ORACLE_SOURCE_TIMEOUT_SECS", "must be positive"));
        }
        if self.sink_timeout.is_zero() {
            return Err(invalid("ORACLE_SINK_TIMEOUT_SECS", "must be positive"));
        }
        if self.max_alerts == 0 {
            return Err(invalid("ORACLE_MAX_ALERTS", "must be at least 1"));
        }
        for (asset, entry) in &self.nav_prices {
            if !(entry.price.is_finite() && entry.price > 0.0) {
                return Err(invalid(
                    "ORACLE_NAV_PRICES",
                    format!("{} has non-positive price {}", asset, entry.price),
                ));
            }
            if !(entry.confidence.is_finite() && (0.0..=1.0).contains(&entry.confidence)) {
                return Err(invalid(
                    "ORACLE_NAV_PRICES",
                    format!("{} confidence {} is not in [0, 1]", asset, entry.confidence),
                ));
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            deviation_threshold: self.deviation_threshold,
            recovery_window_secs: self.recovery_window_secs,
            min_sources: self.min_sources,
            max_alerts: self.max_alerts,
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// `"300,900,3600"` -> short / medium / long windows.
fn parse_twap_windows(value: &str) -> Result<TwapWindows, ConfigError> {
    let key = "ORACLE_TWAP_WINDOWS";
    let secs = value
        .split(',')
        .map(|part| parse::<i64>(key, part.trim()))
        .collect::<Result<Vec<_>, _>>()?;

    match secs.as_slice() {
        [short_secs, medium_secs, long_secs] => Ok(TwapWindows {
            short_secs: *short_secs,
            medium_secs: *medium_secs,
            long_secs: *long_secs,
        }),
        _ => Err(invalid(key, "expected three comma-separated windows")),
    }
}

/// `"SOL,BTC,ETH"` -> Pyth feeds.
fn parse_feeds(value: &str) -> Result<Vec<PythFeed>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|symbol| {
            PythFeed::from_symbol(symbol).ok_or_else(|| {
                invalid("ORACLE_ASSETS", format!("no Pyth feed for {}", symbol))
            })
        })
        .collect()
}

/// `"USTB:10.42,OUSG:105.3:0.95"` -> NAV entries (confidence defaults to 1.0).
fn parse_nav_prices(value: &str) -> Result<Vec<(String, NavEntry)>, ConfigError> {
    let key = "ORACLE_NAV_PRICES";
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let parts: Vec<&str> = item.split(':').map(str::trim).collect();
            let (asset, price, confidence) = match parts.as_slice() {
                [asset, price] => (*asset, parse::<f64>(key, price)?, 1.0),
                [asset, price, confidence] => (
                    *asset,
                    parse::<f64>(key, price)?,
                    parse::<f64>(key, confidence)?,
                ),
                _ => {
                    return Err(ConfigError::Parse {
                        key: key.to_string(),
                        value: item.to_string(),
                    })
                }
            };
            Ok((
                asset.to_uppercase(),
                NavEntry::new(price, confidence, NAV_SOURCE),
            ))
        })
        .collect()
}
