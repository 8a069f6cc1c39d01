//! Price sources.
//!
//! Every vendor's payload is converted into [`RawQuote`] at this boundary so
//! the aggregator, breaker and TWAP engine never see vendor quirks.

mod nav;
mod pyth;

pub use nav::{NavEntry, NavTable, NAV_SOURCE};
pub use pyth::{PythFeed, PythSource, PythStream, HERMES_URL, PYTH_REST_SOURCE, PYTH_STREAM_SOURCE};

use async_trait::async_trait;

use consensus_oracle_types::RawQuote;

use crate::error::SourceError;

/// A polled price source.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Stable identifier used as the quote source id and in status reports.
    fn name(&self) -> &str;

    /// Fetch the latest quotes. `now` is the cycle's clock, in unix seconds.
    async fn fetch(&self, now: i64) -> Result<Vec<RawQuote>, SourceError>;
}

/// Events pushed by a streaming source between cycles.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Quote(RawQuote),
    Connected { source: String },
    Disconnected { source: String },
    Error { source: String, message: String },
}

/// A vendor payload tagged with the vendor it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorQuote {
    /// Pyth price with its integer mantissa, confidence interval and exponent.
    Pyth {
        source: String,
        symbol: String,
        price: i64,
        conf: u64,
        expo: i32,
        publish_time: i64,
    },

    /// Manually curated NAV price.
    Nav {
        asset: String,
        entry: NavEntry,
        observed_at: i64,
    },
}

impl VendorQuote {
    /// Normalize into a [`RawQuote`]. `None` when the payload carries no usable price.
    pub fn normalize(self) -> Option<RawQuote> {
        let quote = match self {
            VendorQuote::Pyth {
                source,
                symbol,
                price,
                conf,
                expo,
                publish_time,
            } => {
                // expo is negative (e.g., -8), so price = raw * 10^expo
                let multiplier = 10f64.powi(expo);
                let price = price as f64 * multiplier;
                let interval = conf as f64 * multiplier;
                // A confidence interval as wide as the price means no confidence.
                let confidence = if price > 0.0 {
                    1.0 - (interval / price).min(1.0)
                } else {
                    0.0
                };
                RawQuote::new(symbol, price, source, publish_time, confidence)
            }
            VendorQuote::Nav {
                asset,
                entry,
                observed_at,
            } => RawQuote::new(asset, entry.price, entry.source, observed_at, entry.confidence),
        };

        quote.is_valid().then_some(quote)
    }
}
