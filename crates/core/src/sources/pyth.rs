//! Pyth Hermes adapters.
//!
//! [`PythSource`] polls the Hermes REST API once per cycle; [`PythStream`]
//! follows the Hermes Server-Sent Events stream and pushes quotes between
//! cycles.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_client::{Client, SSE};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use consensus_oracle_types::RawQuote;

use super::{PriceSource, StreamEvent, VendorQuote};
use crate::error::SourceError;

/// Default Hermes API endpoint.
pub const HERMES_URL: &str = "https://hermes.pyth.network";

/// Source id of the REST adapter.
pub const PYTH_REST_SOURCE: &str = "pyth-hermes";

/// Source id of the streaming adapter.
pub const PYTH_STREAM_SOURCE: &str = "pyth-stream";

/// Delay before reconnecting a dropped stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Pyth Hermes API response for price updates.
#[derive(Debug, Deserialize)]
struct HermesPriceResponse {
    parsed: Vec<ParsedPrice>,
}

#[derive(Debug, Deserialize)]
struct ParsedPrice {
    id: String,
    price: PriceData,
}

#[derive(Debug, Deserialize)]
struct PriceData {
    price: String,
    conf: String,
    expo: i32,
    publish_time: i64,
}

/// Assets with a Pyth price feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PythFeed {
    Sol,
    Btc,
    Eth,
}

impl PythFeed {
    /// Returns the Pyth price feed ID for this asset.
    pub fn feed_id(&self) -> &'static str {
        match self {
            PythFeed::Sol => "0xef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d",
            PythFeed::Btc => "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
            PythFeed::Eth => "0xff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            PythFeed::Sol => "SOL",
            PythFeed::Btc => "BTC",
            PythFeed::Eth => "ETH",
        }
    }

    /// Parse a feed from its ID, with or without the `0x` prefix.
    pub fn from_feed_id(feed_id: &str) -> Option<Self> {
        let normalized = if feed_id.starts_with("0x") {
            feed_id.to_lowercase()
        } else {
            format!("0x{}", feed_id.to_lowercase())
        };
        Self::all()
            .iter()
            .copied()
            .find(|feed| feed.feed_id() == normalized)
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|feed| feed.symbol().eq_ignore_ascii_case(symbol))
    }

    pub fn all() -> &'static [PythFeed] {
        &[PythFeed::Sol, PythFeed::Btc, PythFeed::Eth]
    }
}

impl std::fmt::Display for PythFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

fn feed_query(feeds: &[PythFeed]) -> String {
    feeds
        .iter()
        .map(|feed| format!("ids[]={}", feed.feed_id()))
        .collect::<Vec<_>>()
        .join("&")
}

/// Convert a Hermes price into a quote tagged with `source`.
fn parse_price(source: &str, parsed: ParsedPrice) -> Option<RawQuote> {
    let feed = PythFeed::from_feed_id(&parsed.id)?;

    let price: i64 = parsed.price.price.parse().ok()?;
    let conf: u64 = parsed.price.conf.parse().ok()?;

    VendorQuote::Pyth {
        source: source.to_string(),
        symbol: feed.symbol().to_string(),
        price,
        conf,
        expo: parsed.price.expo,
        publish_time: parsed.price.publish_time,
    }
    .normalize()
}

/// Polls Hermes for the latest price of every configured feed.
pub struct PythSource {
    client: reqwest::Client,
    feeds: Vec<PythFeed>,
    hermes_url: String,
}

impl PythSource {
    pub fn new(feeds: Vec<PythFeed>) -> Self {
        Self::with_url(feeds, HERMES_URL)
    }

    /// Create a source against a custom Hermes URL.
    pub fn with_url(feeds: Vec<PythFeed>, url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            feeds,
            hermes_url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceSource for PythSource {
    fn name(&self) -> &str {
        PYTH_REST_SOURCE
    }

    async fn fetch(&self, _now: i64) -> Result<Vec<RawQuote>, SourceError> {
        if self.feeds.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/v2/updates/price/latest?{}",
            self.hermes_url,
            feed_query(&self.feeds)
        );
        debug!("Fetching latest prices from: {}", url);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.text().await?;
        let data: HermesPriceResponse = serde_json::from_str(&body)?;

        Ok(data
            .parsed
            .into_iter()
            .filter_map(|p| parse_price(PYTH_REST_SOURCE, p))
            .collect())
    }
}

/// Follows the Hermes SSE stream and forwards quotes to the oracle.
pub struct PythStream {
    event_tx: mpsc::Sender<StreamEvent>,
    feeds: Vec<PythFeed>,
    hermes_url: String,
}

impl PythStream {
    pub fn new(event_tx: mpsc::Sender<StreamEvent>, feeds: Vec<PythFeed>) -> Self {
        Self::with_url(event_tx, feeds, HERMES_URL)
    }

    pub fn with_url(event_tx: mpsc::Sender<StreamEvent>, feeds: Vec<PythFeed>, url: &str) -> Self {
        Self {
            event_tx,
            feeds,
            hermes_url: url.trim_end_matches('/').to_string(),
        }
    }

    /// Stream indefinitely, reconnecting on disconnect. Returns once the
    /// receiving side of the channel is gone.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("Pyth stream closed gracefully");
                }
                Err(e) => {
                    error!("Pyth stream error: {}", e);
                    let _ = self
                        .event_tx
                        .send(StreamEvent::Error {
                            source: PYTH_STREAM_SOURCE.to_string(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }

            if self.event_tx.is_closed() {
                info!("Oracle dropped the stream channel, stopping Pyth stream");
                return Ok(());
            }

            let _ = self
                .event_tx
                .send(StreamEvent::Disconnected {
                    source: PYTH_STREAM_SOURCE.to_string(),
                })
                .await;

            info!("Reconnecting to Pyth stream in {:?}...", RECONNECT_DELAY);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_stream(&mut self) -> anyhow::Result<()> {
        let url = format!(
            "{}/v2/updates/price/stream?{}",
            self.hermes_url,
            feed_query(&self.feeds)
        );
        info!("Connecting to Pyth Hermes SSE stream: {}", url);

        let client = eventsource_client::ClientBuilder::for_url(&url)?.build();
        let mut stream = client.stream();

        let _ = self
            .event_tx
            .send(StreamEvent::Connected {
                source: PYTH_STREAM_SOURCE.to_string(),
            })
            .await;

        while let Some(event) = stream.next().await {
            match event {
                Ok(SSE::Event(ev)) => {
                    if ev.event_type != "message" {
                        continue;
                    }
                    match serde_json::from_str::<HermesPriceResponse>(&ev.data) {
                        Ok(update) => {
                            for parsed in update.parsed {
                                if let Some(quote) = parse_price(PYTH_STREAM_SOURCE, parsed) {
                                    debug!(
                                        "{}: ${:.4} (conf: {:.4})",
                                        quote.asset, quote.price, quote.confidence
                                    );
                                    if self.event_tx.send(StreamEvent::Quote(quote)).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SSE data: {} - {}", e, ev.data);
                        }
                    }
                }
                Ok(SSE::Comment(_)) | Ok(SSE::Connected(_)) => {
                    // Heartbeat or connection confirmation, ignore
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("SSE stream error: {}", e));
                }
            }
        }

        Ok(())
    }
}
