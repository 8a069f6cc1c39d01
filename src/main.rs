//! Consensus Oracle Service
//!
//! Polls Pyth Hermes (optionally following its SSE stream), merges in the
//! curated NAV table, and publishes one consensus price per asset per cycle.
//!
//! # Usage
//!
//! ```bash
//! ORACLE_MIN_SOURCES=1 ORACLE_NAV_PRICES=USTB:10.42 cargo run
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use consensus_oracle::{
    ChannelBroadcaster, CsvPriceStore, NavTable, Oracle, OracleConfig, OracleEvent, PythSource,
    PythStream,
};
use consensus_oracle_core::sources::PYTH_STREAM_SOURCE;

/// Capacity of the streaming source's channel into the oracle.
const STREAM_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match OracleConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Starting Consensus Oracle Service");
    info!(
        "Tracking feeds: {}",
        config
            .pyth_feeds
            .iter()
            .map(|f| f.symbol())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let nav = NavTable::with_entries(config.nav_prices.clone());
    if !config.nav_prices.is_empty() {
        info!("Seeded {} NAV prices", config.nav_prices.len());
    }

    let broadcaster = Arc::new(ChannelBroadcaster::default());
    spawn_event_logger(broadcaster.subscribe());

    let mut builder = Oracle::builder(config.clone())
        .source(Arc::new(PythSource::with_url(
            config.pyth_feeds.clone(),
            &config.hermes_url,
        )))
        .nav_table(nav)
        .broadcaster(broadcaster.clone());

    if config.pyth_stream {
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut stream = PythStream::with_url(stream_tx, config.pyth_feeds.clone(), &config.hermes_url);
        tokio::spawn(async move {
            if let Err(e) = stream.run().await {
                error!("Pyth stream error: {}", e);
            }
        });
        builder = builder.stream(&[PYTH_STREAM_SOURCE], stream_rx);
        info!("Following Pyth Hermes stream");
    }

    if let Some(path) = &config.price_log {
        builder = builder.store(Arc::new(CsvPriceStore::open(path)?));
    }

    if config.settlement_sync {
        warn!("Settlement sync enabled but no settlement client is configured; skipping");
    }

    let oracle = Arc::new(builder.build()?);
    let handle = oracle.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;

    let status = oracle.status().await;
    info!(
        "Final status: {:?}, {} prices, {} breakers tripped",
        status.health,
        status.prices.len(),
        status.breakers.iter().filter(|b| b.is_tripped).count()
    );

    Ok(())
}

/// Log what subscribers would receive.
fn spawn_event_logger(mut rx: broadcast::Receiver<consensus_oracle::TopicMessage>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match message.event {
                    OracleEvent::Price(publication) => {
                        let twap = publication
                            .twap
                            .as_ref()
                            .and_then(|t| t.price_5m)
                            .map(|p| format!("${:.4}", p))
                            .unwrap_or_else(|| "-".to_string());
                        info!(
                            "{}: ${:.4} (conf: {:.3}, sources: {}, twap 5m: {}, trusted: {})",
                            message.topic,
                            publication.price.median_price,
                            publication.price.confidence,
                            publication.price.sources.len(),
                            twap,
                            publication.trusted
                        );
                    }
                    OracleEvent::Alert(alert) => {
                        warn!("{} [{}] {}", message.topic, alert.kind, alert.message);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
