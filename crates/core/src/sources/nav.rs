//! Manually curated NAV prices for assets with no public market feed
//! (tokenized treasuries, private credit funds).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use consensus_oracle_types::RawQuote;

use super::VendorQuote;

/// Source id used when an entry does not name its own.
pub const NAV_SOURCE: &str = "manual-nav";

/// One curated price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavEntry {
    pub price: f64,
    pub confidence: f64,
    /// Who published the NAV (fund administrator, transfer agent, ...)
    pub source: String,
}

impl NavEntry {
    pub fn new(price: f64, confidence: f64, source: impl Into<String>) -> Self {
        Self {
            price,
            confidence,
            source: source.into(),
        }
    }
}

/// Shared, admin-editable NAV table. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct NavTable {
    entries: Arc<RwLock<BTreeMap<String, NavEntry>>>,
}

impl NavTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, NavEntry)>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries.into_iter().collect())),
        }
    }

    pub async fn set(&self, asset: &str, entry: NavEntry) {
        info!("NAV for {} set to ${:.4} ({})", asset, entry.price, entry.source);
        self.entries.write().await.insert(asset.to_string(), entry);
    }

    pub async fn remove(&self, asset: &str) -> Option<NavEntry> {
        let removed = self.entries.write().await.remove(asset);
        if removed.is_some() {
            info!("NAV for {} removed", asset);
        }
        removed
    }

    pub async fn entries(&self) -> BTreeMap<String, NavEntry> {
        self.entries.read().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Current table as quotes observed at `now`.
    pub async fn quotes(&self, now: i64) -> Vec<RawQuote> {
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|(asset, entry)| {
                VendorQuote::Nav {
                    asset: asset.clone(),
                    entry: entry.clone(),
                    observed_at: now,
                }
                .normalize()
            })
            .collect()
    }
}
