//! Per-asset circuit breaker.
//!
//! Every consensus price is checked against the last price the breaker
//! trusted. A jump beyond the deviation threshold, or too few sources behind
//! the price, trips the breaker. Once tripped it stays tripped for the whole
//! recovery window no matter what the feed does, so a noisy recovery cannot
//! flap the breaker open and shut.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use consensus_oracle_types::{Alert, AlertKind, BreakerState};

use crate::error::OracleError;

/// Default relative move that trips the breaker (10%).
pub const DEFAULT_DEVIATION_THRESHOLD: f64 = 0.10;

/// Default time a tripped breaker stays tripped, in seconds (5 minutes).
pub const DEFAULT_RECOVERY_WINDOW_SECS: i64 = 5 * 60;

/// Default minimum number of sources behind a trusted price.
pub const DEFAULT_MIN_SOURCES: usize = 1;

/// Default number of alerts kept before the oldest are evicted.
pub const DEFAULT_MAX_ALERTS: usize = 1000;

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub deviation_threshold: f64,
    pub recovery_window_secs: i64,
    pub min_sources: usize,
    pub max_alerts: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: DEFAULT_DEVIATION_THRESHOLD,
            recovery_window_secs: DEFAULT_RECOVERY_WINDOW_SECS,
            min_sources: DEFAULT_MIN_SOURCES,
            max_alerts: DEFAULT_MAX_ALERTS,
        }
    }
}

/// Why a breaker tripped.
#[derive(Debug, Clone, PartialEq)]
pub enum TripReason {
    InsufficientSources { observed: usize, required: usize },
    Deviation { deviation: f64, threshold: f64 },
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::InsufficientSources { observed, required } => {
                write!(f, "Insufficient sources: {} < {}", observed, required)
            }
            TripReason::Deviation {
                deviation,
                threshold,
            } => write!(
                f,
                "Price deviation {:.2}% exceeds threshold {:.2}%",
                deviation * 100.0,
                threshold * 100.0
            ),
        }
    }
}

impl TripReason {
    /// The pipeline error this trip corresponds to.
    pub fn to_error(&self, asset: &str) -> OracleError {
        match *self {
            TripReason::InsufficientSources { observed, required } => {
                OracleError::InsufficientSources {
                    asset: asset.to_string(),
                    observed,
                    required,
                }
            }
            TripReason::Deviation {
                deviation,
                threshold,
            } => OracleError::PriceDeviation {
                asset: asset.to_string(),
                deviation,
                threshold,
            },
        }
    }
}

/// Breaker states and alert log for every observed asset.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: BTreeMap<String, BreakerState>,
    /// Cause of each currently tripped breaker.
    reasons: HashMap<String, TripReason>,
    /// Alert log with each alert's sequence number, oldest first.
    alerts: VecDeque<(u64, Alert)>,
    next_alert_id: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
            reasons: HashMap::new(),
            alerts: VecDeque::new(),
            next_alert_id: 1,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Evaluate a new consensus price for `asset` and return the resulting state.
    ///
    /// The first observation of an asset only anchors the breaker and never
    /// trips. A tripped breaker ignores prices until `recovers_at`; the first
    /// evaluation after that recovers it and judges the price afresh.
    pub fn check(&mut self, asset: &str, price: f64, source_count: usize, now: i64) -> BreakerState {
        let Some(mut state) = self.states.get(asset).cloned() else {
            debug!("Circuit breaker initialized for {} at ${:.4}", asset, price);
            let state = BreakerState::normal(asset, price);
            self.states.insert(asset.to_string(), state.clone());
            return state;
        };

        if state.is_tripped {
            match state.recovers_at {
                Some(recovers_at) if now < recovers_at => {
                    debug!(
                        "Circuit breaker for {} still tripped ({}s to recovery), observed ${:.4}",
                        asset,
                        recovers_at - now,
                        price
                    );
                    return state;
                }
                _ => {
                    clear_trip(&mut state);
                    self.reasons.remove(asset);
                    // A market that held its new level through the whole
                    // recovery window becomes the new baseline.
                    if source_count >= self.config.min_sources {
                        state.last_valid_price = price;
                    }
                    info!(
                        "Circuit breaker for {} recovered after window, baseline ${:.4}",
                        asset, state.last_valid_price
                    );
                    self.push_alert(
                        AlertKind::CircuitBreakerRecover,
                        asset,
                        format!("Circuit breaker for {} recovered after recovery window", asset),
                        now,
                    );
                }
            }
        }

        match self.evaluate(&state, price, source_count) {
            Some(reason) => {
                state.is_tripped = true;
                state.reason = Some(reason.to_string());
                state.tripped_at = Some(now);
                state.recovers_at = Some(now + self.config.recovery_window_secs);

                warn!(
                    "Circuit breaker TRIPPED for {}: {} (last valid ${:.4}, observed ${:.4})",
                    asset, reason, state.last_valid_price, price
                );
                self.push_alert(
                    AlertKind::CircuitBreakerTrip,
                    asset,
                    format!("Circuit breaker tripped for {}: {}", asset, reason),
                    now,
                );
                self.reasons.insert(asset.to_string(), reason);
            }
            None => {
                state.last_valid_price = price;
            }
        }

        self.states.insert(asset.to_string(), state.clone());
        state
    }

    /// Evaluate an observed asset that has no surviving quotes this cycle.
    ///
    /// A normal breaker trips on insufficient sources. A tripped breaker stays
    /// tripped: recovery needs a reading, so it waits for quotes to return.
    /// `None` for an asset never observed.
    pub fn check_missing(&mut self, asset: &str, now: i64) -> Option<BreakerState> {
        let state = self.states.get(asset)?;
        if state.is_tripped {
            return Some(state.clone());
        }
        let price = state.last_valid_price;
        Some(self.check(asset, price, 0, now))
    }

    fn evaluate(&self, state: &BreakerState, price: f64, source_count: usize) -> Option<TripReason> {
        if source_count < self.config.min_sources {
            return Some(TripReason::InsufficientSources {
                observed: source_count,
                required: self.config.min_sources,
            });
        }

        if state.last_valid_price <= 0.0 {
            return None;
        }

        let deviation = (price - state.last_valid_price).abs() / state.last_valid_price;
        if deviation >= self.config.deviation_threshold {
            return Some(TripReason::Deviation {
                deviation,
                threshold: self.config.deviation_threshold,
            });
        }

        None
    }

    /// Manually clear a breaker. Returns `None` for an asset never observed.
    pub fn reset(&mut self, asset: &str, now: i64) -> Option<BreakerState> {
        let state = self.states.get_mut(asset)?;
        let was_tripped = state.is_tripped;
        clear_trip(state);
        let state = state.clone();
        self.reasons.remove(asset);

        info!(
            "Circuit breaker for {} manually reset (was tripped: {})",
            asset, was_tripped
        );
        self.push_alert(
            AlertKind::CircuitBreakerRecover,
            asset,
            format!("Circuit breaker for {} manually reset", asset),
            now,
        );

        Some(state)
    }

    pub fn state(&self, asset: &str) -> Option<&BreakerState> {
        self.states.get(asset)
    }

    /// Cause of the current trip, if the breaker is tripped.
    pub fn trip_reason(&self, asset: &str) -> Option<&TripReason> {
        self.reasons.get(asset)
    }

    pub fn is_tripped(&self, asset: &str) -> bool {
        self.states.get(asset).map(|s| s.is_tripped).unwrap_or(false)
    }

    /// Snapshot of every observed asset, ordered by symbol.
    pub fn states(&self) -> Vec<BreakerState> {
        self.states.values().cloned().collect()
    }

    /// The alert log, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.iter().map(|(_, alert)| alert.clone()).collect()
    }

    /// Sequence number the next alert will get.
    pub fn alert_seq(&self) -> u64 {
        self.next_alert_id
    }

    /// Alerts recorded at or after sequence number `seq`.
    pub fn alerts_since(&self, seq: u64) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|(id, _)| *id >= seq)
            .map(|(_, alert)| alert.clone())
            .collect()
    }

    fn push_alert(&mut self, kind: AlertKind, asset: &str, message: String, now: i64) {
        let seq = self.next_alert_id;
        let alert = Alert {
            id: format!("alert-{}", seq),
            kind,
            asset: asset.to_string(),
            message,
            timestamp: now,
        };
        self.next_alert_id += 1;

        self.alerts.push_back((seq, alert));
        while self.alerts.len() > self.config.max_alerts {
            self.alerts.pop_front();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn clear_trip(state: &mut BreakerState) {
    state.is_tripped = false;
    state.reason = None;
    state.tripped_at = None;
    state.recovers_at = None;
}
