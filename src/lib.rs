//! Consensus Price Oracle
//!
//! Turns independent price quotes into one trusted price per asset.
//!
//! # Features
//!
//! - **Median consensus** across REST, streaming and manual NAV sources
//! - **Circuit breakers** with hysteresis and an alert log
//! - **Rolling TWAPs** over 5m / 15m / 1h windows
//! - **Best-effort sinks** for a CSV price log and settlement sync
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use consensus_oracle::{ChannelBroadcaster, Oracle, OracleConfig, OracleEvent, PythSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OracleConfig::from_env()?;
//!     let broadcaster = Arc::new(ChannelBroadcaster::default());
//!     let mut rx = broadcaster.subscribe();
//!
//!     let oracle = Arc::new(
//!         Oracle::builder(config.clone())
//!             .source(Arc::new(PythSource::new(config.pyth_feeds.clone())))
//!             .broadcaster(broadcaster)
//!             .build()?,
//!     );
//!     let handle = oracle.start();
//!
//!     while let Ok(message) = rx.recv().await {
//!         if let OracleEvent::Price(publication) = message.event {
//!             println!("{}: ${:.2}", publication.price.asset, publication.price.median_price);
//!         }
//!     }
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod oracle;
pub mod sinks;

pub use broadcast::{Broadcaster, ChannelBroadcaster, TopicMessage, DEFAULT_CHANNEL_CAPACITY};
pub use config::{ConfigError, OracleConfig};
pub use oracle::{Oracle, OracleBuilder, OracleHandle};
pub use sinks::{CsvPriceStore, PriceRecord, PriceStore, SettlementSync};

pub use consensus_oracle_core::{
    aggregate_prices, BreakerConfig, CircuitBreaker, NavEntry, NavTable, OracleError, PriceSource,
    PythFeed, PythSource, PythStream, SourceError, StreamEvent, TwapEngine, TwapWindows,
};
pub use consensus_oracle_types::{
    AggregatedPrice, Alert, AlertKind, BreakerState, CycleReport, HealthLevel, OracleEvent,
    OracleStatus, PricePublication, RawQuote, SourceKind, SourceStatus, TwapState,
};
