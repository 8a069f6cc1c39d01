//! Error taxonomy for the oracle pipeline.
//!
//! Only configuration errors are fatal. Everything else is caught where it
//! happens, logged, and shows up in the oracle status instead.

use std::time::Duration;

/// Failure of a single price source for one cycle.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("Insufficient sources for {asset}: {observed} < {required}")]
    InsufficientSources {
        asset: String,
        observed: usize,
        required: usize,
    },

    #[error("Price deviation for {asset}: {deviation:.4} >= {threshold:.4}")]
    PriceDeviation {
        asset: String,
        deviation: f64,
        threshold: f64,
    },

    #[error("Failed to persist price for {asset}: {reason}")]
    PersistenceFailure { asset: String, reason: String },

    #[error("Failed to sync settlement price for {asset}: {reason}")]
    SettlementSyncFailure { asset: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl OracleError {
    /// Whether the error must stop the oracle from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OracleError::Configuration(_))
    }
}
