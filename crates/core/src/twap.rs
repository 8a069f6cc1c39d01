//! TWAP (Time-Weighted Average Price) engine.
//!
//! Keeps a rolling, time-pruned sample history per asset and derives the
//! short, medium and long window averages every time a sample is added.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use consensus_oracle_types::{TwapSample, TwapState};

/// Default short window in seconds (5 minutes).
pub const DEFAULT_SHORT_WINDOW_SECS: i64 = 5 * 60;

/// Default medium window in seconds (15 minutes).
pub const DEFAULT_MEDIUM_WINDOW_SECS: i64 = 15 * 60;

/// Default long window in seconds (1 hour). Also the retention horizon.
pub const DEFAULT_LONG_WINDOW_SECS: i64 = 60 * 60;

/// The three lookback windows, shortest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwapWindows {
    pub short_secs: i64,
    pub medium_secs: i64,
    pub long_secs: i64,
}

impl Default for TwapWindows {
    fn default() -> Self {
        Self {
            short_secs: DEFAULT_SHORT_WINDOW_SECS,
            medium_secs: DEFAULT_MEDIUM_WINDOW_SECS,
            long_secs: DEFAULT_LONG_WINDOW_SECS,
        }
    }
}

/// Rolling TWAP store for every asset the oracle prices.
pub struct TwapEngine {
    /// Samples per asset, keyed by symbol, oldest first.
    samples: HashMap<String, VecDeque<TwapSample>>,

    windows: TwapWindows,
}

impl TwapEngine {
    /// Create a new engine with the default 5m / 15m / 1h windows.
    pub fn new() -> Self {
        Self::with_windows(TwapWindows::default())
    }

    /// Create a new engine with custom windows.
    pub fn with_windows(windows: TwapWindows) -> Self {
        Self {
            samples: HashMap::new(),
            windows,
        }
    }

    pub fn windows(&self) -> TwapWindows {
        self.windows
    }

    /// Record a price sample and return the refreshed state.
    ///
    /// Samples older than the long window, measured from the newest sample,
    /// are pruned. Samples are kept in arrival order.
    pub fn update(&mut self, asset: &str, price: f64, timestamp: i64) -> Result<TwapState, TwapError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(TwapError::InvalidPrice { price });
        }

        let windows = self.windows;
        let samples = self.samples.entry(asset.to_string()).or_default();
        samples.push_back(TwapSample { price, timestamp });

        let newest = samples.iter().map(|s| s.timestamp).max().unwrap_or(timestamp);
        let cutoff = newest - windows.long_secs;
        let original_len = samples.len();
        samples.retain(|s| s.timestamp >= cutoff);
        let pruned = original_len - samples.len();
        if pruned > 0 {
            debug!("Pruned {} old TWAP samples for {}", pruned, asset);
        }

        debug!(
            "TWAP sample recorded for {}: ${:.4} at {}",
            asset, price, timestamp
        );

        Ok(snapshot(asset, samples, windows))
    }

    /// Current state for an asset without recording anything.
    pub fn get(&self, asset: &str) -> Option<TwapState> {
        self.samples
            .get(asset)
            .map(|samples| snapshot(asset, samples, self.windows))
    }

    /// Get the current number of samples for an asset.
    pub fn sample_count(&self, asset: &str) -> usize {
        self.samples.get(asset).map(|s| s.len()).unwrap_or(0)
    }

    /// Clear all samples for an asset.
    pub fn clear_asset(&mut self, asset: &str) {
        self.samples.remove(asset);
        info!("Cleared TWAP samples for {}", asset);
    }

    /// Clear every asset.
    pub fn clear(&mut self) {
        let assets = self.samples.len();
        self.samples.clear();
        info!("Cleared TWAP samples for {} assets", assets);
    }
}

impl Default for TwapEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the public state for an asset's retained samples.
fn snapshot(asset: &str, samples: &VecDeque<TwapSample>, windows: TwapWindows) -> TwapState {
    let last_sample_ts = samples.iter().map(|s| s.timestamp).max();
    let (price_5m, price_15m, price_1h) = match last_sample_ts {
        Some(end) => (
            window_average(samples, end, windows.short_secs),
            window_average(samples, end, windows.medium_secs),
            window_average(samples, end, windows.long_secs),
        ),
        None => (None, None, None),
    };

    TwapState {
        asset: asset.to_string(),
        samples: samples.iter().cloned().collect(),
        price_5m,
        price_15m,
        price_1h,
        sample_count: samples.len(),
        last_sample_ts,
    }
}

/// Time-weighted average of the samples in `[end - window_secs, end]`.
///
/// Each sample is weighted by how long it stayed the latest price, clamped
/// to `end`. If no time elapsed between the in-window samples the plain mean
/// is returned.
fn window_average(samples: &VecDeque<TwapSample>, end: i64, window_secs: i64) -> Option<f64> {
    let start = end - window_secs;
    let in_window: Vec<&TwapSample> = samples
        .iter()
        .filter(|s| s.timestamp >= start && s.timestamp <= end)
        .collect();

    if in_window.is_empty() {
        return None;
    }

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (i, sample) in in_window.iter().enumerate() {
        let until = in_window
            .get(i + 1)
            .map(|next| next.timestamp.min(end))
            .unwrap_or(end);
        let weight = (until - sample.timestamp).max(0) as f64;
        weighted_sum += sample.price * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        Some(weighted_sum / total_weight)
    } else {
        let sum: f64 = in_window.iter().map(|s| s.price).sum();
        Some(sum / in_window.len() as f64)
    }
}

/// Errors that can occur while recording TWAP samples.
#[derive(Debug, thiserror::Error)]
pub enum TwapError {
    #[error("Invalid TWAP sample price: {price}")]
    InvalidPrice { price: f64 },
}
