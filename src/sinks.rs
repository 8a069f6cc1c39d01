//! Optional downstream collaborators: price persistence and settlement sync.
//!
//! Both are best-effort. The orchestrator bounds every call with a timeout
//! and only logs failures; the next cycle simply tries again.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::info;

use consensus_oracle_types::AggregatedPrice;

/// Appends published price points to durable storage.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn append(
        &self,
        asset: &str,
        price: f64,
        confidence: f64,
        source: &str,
        timestamp: i64,
    ) -> Result<()>;
}

/// Pushes consensus prices to the settlement layer.
#[async_trait]
pub trait SettlementSync: Send + Sync {
    async fn sync(&self, price: &AggregatedPrice) -> Result<()>;
}

/// Price point row in the CSV price log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub timestamp: i64,
    pub asset: String,
    pub price: f64,
    pub confidence: f64,
    pub source: String,
}

/// [`PriceStore`] writing one CSV row per price point.
///
/// File I/O runs on the blocking pool, off the runtime's worker threads.
pub struct CsvPriceStore {
    path: PathBuf,
    writer: Arc<Mutex<csv::Writer<fs::File>>>,
}

impl CsvPriceStore {
    /// Open (or create) the CSV file at `path`, appending to existing data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create price log directory")?;
        }

        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open price log")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        info!("Price log at {}", path.display());

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back (diagnostics and tests).
    pub fn read_all(&self) -> Result<Vec<PriceRecord>> {
        let mut reader = csv::Reader::from_path(&self.path).context("Failed to read price log")?;
        reader
            .deserialize::<PriceRecord>()
            .map(|row| row.context("Malformed price log row"))
            .collect()
    }
}

#[async_trait]
impl PriceStore for CsvPriceStore {
    async fn append(
        &self,
        asset: &str,
        price: f64,
        confidence: f64,
        source: &str,
        timestamp: i64,
    ) -> Result<()> {
        let record = PriceRecord {
            timestamp,
            asset: asset.to_string(),
            price,
            confidence,
            source: source.to_string(),
        };

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| anyhow!("Price log writer poisoned"))?;
            writer
                .serialize(&record)
                .context("Failed to write price record")?;
            writer.flush().context("Failed to flush price log")?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Price log writer task failed")?
    }
}
