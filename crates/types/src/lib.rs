//! Data model for the consensus price oracle.
//!
//! Everything that crosses a crate or process boundary lives here: quotes
//! coming in from sources, consensus prices and TWAPs going out to
//! subscribers, breaker state and alerts, and the health report.

use serde::{Deserialize, Serialize};

/// Topic prefix for per-asset price publications.
pub const PRICE_TOPIC_PREFIX: &str = "prices";

/// Topic prefix for per-asset breaker alerts.
pub const ALERT_TOPIC_PREFIX: &str = "alerts";

/// Topic for price publications of `asset` (e.g. `prices:BTC`).
pub fn price_topic(asset: &str) -> String {
    format!("{}:{}", PRICE_TOPIC_PREFIX, asset)
}

/// Topic for breaker alerts of `asset` (e.g. `alerts:BTC`).
pub fn alert_topic(asset: &str) -> String {
    format!("{}:{}", ALERT_TOPIC_PREFIX, asset)
}

/// One source's reported price for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuote {
    /// The asset symbol (e.g., "BTC", "USTB")
    pub asset: String,

    /// Price in USD
    pub price: f64,

    /// Identifier of the source that produced the quote
    pub source: String,

    /// Unix timestamp in seconds when the source observed this price
    pub timestamp: i64,

    /// Source-reported reliability (0.0 to 1.0)
    pub confidence: f64,
}

impl RawQuote {
    pub fn new(
        asset: impl Into<String>,
        price: f64,
        source: impl Into<String>,
        timestamp: i64,
        confidence: f64,
    ) -> Self {
        Self {
            asset: asset.into(),
            price,
            source: source.into(),
            timestamp,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// A quote is usable when its price is a finite positive number and its
    /// confidence is finite.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite()
            && self.price > 0.0
            && self.confidence.is_finite()
            && !self.asset.is_empty()
    }
}

/// Consensus price for one asset, recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub asset: String,

    /// Median of the surviving source prices
    pub median_price: f64,

    /// Sources that contributed a non-stale quote
    pub sources: Vec<String>,

    /// Consensus confidence in (0.0, 1.0]
    pub confidence: f64,

    /// Unix timestamp in seconds of the aggregation
    pub timestamp: i64,
}

/// A TWAP (time-weighted average price) sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwapSample {
    /// The price at this sample time
    pub price: f64,

    /// Unix timestamp in seconds
    pub timestamp: i64,
}

/// Rolling TWAP state for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwapState {
    pub asset: String,

    /// Retained samples, oldest first
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub samples: Vec<TwapSample>,

    /// 5-minute TWAP (None when no sample falls in the window)
    pub price_5m: Option<f64>,

    /// 15-minute TWAP
    pub price_15m: Option<f64>,

    /// 1-hour TWAP
    pub price_1h: Option<f64>,

    /// Number of retained samples
    pub sample_count: usize,

    /// Timestamp of the newest sample
    pub last_sample_ts: Option<i64>,
}

/// Circuit breaker state for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub asset: String,

    /// True while the asset's feed is not trusted
    pub is_tripped: bool,

    /// Last price accepted as trustworthy
    pub last_valid_price: f64,

    /// Why the breaker tripped
    pub reason: Option<String>,

    /// Unix timestamp in seconds of the trip
    pub tripped_at: Option<i64>,

    /// Earliest time the breaker may recover
    pub recovers_at: Option<i64>,
}

impl BreakerState {
    /// A fresh, untripped breaker anchored at `price`.
    pub fn normal(asset: impl Into<String>, price: f64) -> Self {
        Self {
            asset: asset.into(),
            is_tripped: false,
            last_valid_price: price,
            reason: None,
            tripped_at: None,
            recovers_at: None,
        }
    }
}

/// Kind of breaker alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CircuitBreakerTrip,
    CircuitBreakerRecover,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CircuitBreakerTrip => "circuit_breaker_trip",
            AlertKind::CircuitBreakerRecover => "circuit_breaker_recover",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker trip or recovery notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,

    pub asset: String,
    pub message: String,

    /// Unix timestamp in seconds
    pub timestamp: i64,
}

/// Snapshot published to `prices:<ASSET>` every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePublication {
    pub price: AggregatedPrice,

    /// TWAP after this cycle's update (unchanged while the breaker is tripped)
    pub twap: Option<TwapState>,

    pub breaker: BreakerState,

    /// False when the breaker withholds trust from `price`
    pub trusted: bool,
}

/// Events published by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleEvent {
    /// Consensus price, TWAP and breaker snapshot for one asset
    Price(PricePublication),

    /// A breaker tripped or recovered
    Alert(Alert),
}

/// How a source delivers quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rest,
    Stream,
    Manual,
}

/// Per-source health as seen by the last cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub name: String,
    pub kind: SourceKind,
    pub up: bool,

    /// Quotes contributed by this source in the last cycle
    pub quotes_last_cycle: usize,

    pub consecutive_failures: u32,
    pub last_success: Option<i64>,
    pub last_error: Option<String>,
}

impl SourceStatus {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            up: false,
            quotes_last_cycle: 0,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
        }
    }
}

/// Overall pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Every source up and no breaker tripped
    Healthy,
    /// Producing prices, but a source is down or a breaker is tripped
    Degraded,
    /// No prices are being produced
    Down,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Unix timestamp in seconds the cycle ran at
    pub timestamp: i64,
    pub quotes_gathered: usize,
    pub assets_aggregated: usize,
    pub breakers_tripped: usize,
    pub duration_ms: u64,
}

/// Operator-facing status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleStatus {
    pub health: HealthLevel,
    pub sources: Vec<SourceStatus>,
    pub prices: Vec<AggregatedPrice>,
    pub breakers: Vec<BreakerState>,
    pub last_cycle: Option<CycleReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        assert_eq!(price_topic("BTC"), "prices:BTC");
        assert_eq!(alert_topic("ETH"), "alerts:ETH");
    }

    #[test]
    fn test_quote_validity() {
        assert!(RawQuote::new("BTC", 60000.0, "a", 0, 1.0).is_valid());
        assert!(!RawQuote::new("BTC", 0.0, "a", 0, 1.0).is_valid());
        assert!(!RawQuote::new("BTC", -1.0, "a", 0, 1.0).is_valid());
        assert!(!RawQuote::new("BTC", f64::NAN, "a", 0, 1.0).is_valid());
        assert!(!RawQuote::new("", 1.0, "a", 0, 1.0).is_valid());
        assert!(!RawQuote::new("BTC", 60000.0, "a", 0, f64::NAN).is_valid());
    }

    #[test]
    fn test_quote_confidence_clamped() {
        assert_eq!(RawQuote::new("BTC", 1.0, "a", 0, 1.7).confidence, 1.0);
        assert_eq!(RawQuote::new("BTC", 1.0, "a", 0, -0.2).confidence, 0.0);
    }

    #[test]
    fn test_alert_wire_format() {
        let alert = Alert {
            id: "alert-1".to_string(),
            kind: AlertKind::CircuitBreakerTrip,
            asset: "BTC".to_string(),
            message: "tripped".to_string(),
            timestamp: 1000,
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "circuit_breaker_trip");
    }

    #[test]
    fn test_event_tagging() {
        let event = OracleEvent::Alert(Alert {
            id: "alert-2".to_string(),
            kind: AlertKind::CircuitBreakerRecover,
            asset: "SOL".to_string(),
            message: "recovered".to_string(),
            timestamp: 1000,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"alert\""));
    }
}
