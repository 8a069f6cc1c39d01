//! Core domain logic for the consensus oracle.
//!
//! - [`aggregator`]: median consensus across sources
//! - [`twap`]: rolling 5m / 15m / 1h time-weighted averages
//! - [`breaker`]: per-asset circuit breakers and the alert log
//! - [`sources`]: the price-source boundary (Pyth Hermes, manual NAV table)
//!
//! Nothing in here reads the wall clock: every operation takes `now` so the
//! pipeline can be replayed deterministically.

pub mod aggregator;
pub mod breaker;
pub mod error;
pub mod sources;
pub mod twap;

pub use aggregator::{aggregate_prices, calculate_median, consensus_confidence, DEFAULT_STALENESS_SECS};
pub use breaker::{
    BreakerConfig, CircuitBreaker, TripReason, DEFAULT_DEVIATION_THRESHOLD, DEFAULT_MAX_ALERTS,
    DEFAULT_MIN_SOURCES, DEFAULT_RECOVERY_WINDOW_SECS,
};
pub use error::{OracleError, SourceError};
pub use sources::{NavEntry, NavTable, PriceSource, PythFeed, PythSource, PythStream, StreamEvent, VendorQuote};
pub use twap::{TwapEngine, TwapError, TwapWindows};
