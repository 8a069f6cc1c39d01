//! Oracle cycle orchestrator.
//!
//! One [`Oracle`] owns the whole pipeline state. Each cycle:
//!
//! 1. gathers quotes from every polled source (concurrently, each under a
//!    timeout), drains streamed quotes, and reads the NAV table
//! 2. aggregates them into one median price per asset
//! 3. runs each price through the asset's circuit breaker
//! 4. feeds trusted prices into the TWAP engine
//! 5. publishes the price / TWAP / breaker snapshot on `prices:<ASSET>`
//! 6. persists and settlement-syncs, best effort
//!
//! A failing step is logged and the cycle carries on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use consensus_oracle_core::sources::NAV_SOURCE;
use consensus_oracle_core::{
    aggregate_prices, CircuitBreaker, NavTable, OracleError, PriceSource, SourceError,
    StreamEvent, TwapEngine,
};
use consensus_oracle_types::{
    alert_topic, price_topic, AggregatedPrice, Alert, BreakerState, CycleReport, HealthLevel,
    OracleEvent, OracleStatus, PricePublication, RawQuote, SourceKind, SourceStatus, TwapState,
};

use crate::broadcast::{Broadcaster, ChannelBroadcaster};
use crate::config::OracleConfig;
use crate::sinks::{PriceStore, SettlementSync};

/// Mutable pipeline state. Only cycle execution and the admin operations on
/// [`Oracle`] touch it, each under the relevant lock.
pub struct OracleState {
    breakers: Mutex<CircuitBreaker>,
    twap: Mutex<TwapEngine>,
    latest: RwLock<BTreeMap<String, AggregatedPrice>>,
    sources: RwLock<BTreeMap<String, SourceStatus>>,
    last_cycle: RwLock<Option<CycleReport>>,
}

impl OracleState {
    fn new(config: &OracleConfig, sources: BTreeMap<String, SourceStatus>) -> Self {
        Self {
            breakers: Mutex::new(CircuitBreaker::new(config.breaker_config())),
            twap: Mutex::new(TwapEngine::with_windows(config.twap_windows)),
            latest: RwLock::new(BTreeMap::new()),
            sources: RwLock::new(sources),
            last_cycle: RwLock::new(None),
        }
    }
}

/// Assembles an [`Oracle`] from its collaborators.
pub struct OracleBuilder {
    config: OracleConfig,
    sources: Vec<Arc<dyn PriceSource>>,
    streams: Vec<String>,
    stream_rx: Option<mpsc::Receiver<StreamEvent>>,
    nav: NavTable,
    broadcaster: Arc<dyn Broadcaster>,
    store: Option<Arc<dyn PriceStore>>,
    settlement: Option<Arc<dyn SettlementSync>>,
}

impl OracleBuilder {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            streams: Vec::new(),
            stream_rx: None,
            nav: NavTable::new(),
            broadcaster: Arc::new(ChannelBroadcaster::default()),
            store: None,
            settlement: None,
        }
    }

    /// Add a polled source.
    pub fn source(mut self, source: Arc<dyn PriceSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Receive streamed events. `names` are the streaming sources feeding
    /// the channel, so they show up in the status before their first event.
    pub fn stream(mut self, names: &[&str], rx: mpsc::Receiver<StreamEvent>) -> Self {
        self.streams = names.iter().map(|n| n.to_string()).collect();
        self.stream_rx = Some(rx);
        self
    }

    pub fn nav_table(mut self, nav: NavTable) -> Self {
        self.nav = nav;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn store(mut self, store: Arc<dyn PriceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settlement(mut self, settlement: Arc<dyn SettlementSync>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    /// Validate the configuration and build the oracle.
    pub fn build(self) -> Result<Oracle, OracleError> {
        self.config.validate()?;

        let mut statuses = BTreeMap::new();
        for source in &self.sources {
            let name = source.name().to_string();
            statuses.insert(name.clone(), SourceStatus::new(name, SourceKind::Rest));
        }
        for name in &self.streams {
            statuses.insert(name.clone(), SourceStatus::new(name.clone(), SourceKind::Stream));
        }
        statuses.insert(
            NAV_SOURCE.to_string(),
            SourceStatus::new(NAV_SOURCE, SourceKind::Manual),
        );

        let state = OracleState::new(&self.config, statuses);

        Ok(Oracle {
            config: self.config,
            sources: self.sources,
            stream_rx: Mutex::new(self.stream_rx),
            nav: self.nav,
            broadcaster: self.broadcaster,
            store: self.store,
            settlement: self.settlement,
            state,
            cycle_lock: Mutex::new(()),
        })
    }
}

/// The price oracle.
pub struct Oracle {
    config: OracleConfig,
    sources: Vec<Arc<dyn PriceSource>>,
    stream_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    nav: NavTable,
    broadcaster: Arc<dyn Broadcaster>,
    store: Option<Arc<dyn PriceStore>>,
    settlement: Option<Arc<dyn SettlementSync>>,
    state: OracleState,
    /// Held for the duration of a cycle; a tick that cannot take it is skipped.
    cycle_lock: Mutex<()>,
}

impl Oracle {
    pub fn builder(config: OracleConfig) -> OracleBuilder {
        OracleBuilder::new(config)
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn nav_table(&self) -> &NavTable {
        &self.nav
    }

    /// Run one cycle at the current wall-clock time.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        self.run_cycle_at(chrono::Utc::now().timestamp()).await
    }

    /// Run one cycle with `now` (unix seconds) as the clock.
    ///
    /// Returns `None` without doing anything if another cycle is in flight.
    pub async fn run_cycle_at(&self, now: i64) -> Option<CycleReport> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            warn!("Previous oracle cycle still running, skipping tick");
            return None;
        };
        let started = Instant::now();

        let quotes = self.gather(now).await;
        let quotes_gathered = quotes.len();
        let valid: Vec<RawQuote> = quotes.into_iter().filter(RawQuote::is_valid).collect();
        if valid.len() < quotes_gathered {
            warn!(
                "Dropped {} malformed quotes",
                quotes_gathered - valid.len()
            );
        }

        let aggregated = aggregate_prices(&valid, self.config.staleness_secs, now);

        let mut breakers_tripped = 0;
        let mut deliveries = Vec::with_capacity(aggregated.len());
        for price in aggregated.values() {
            let trusted = self.process_asset(price, now).await;
            if !trusted {
                breakers_tripped += 1;
            }
            deliveries.push((price, trusted));
        }
        breakers_tripped += self.check_missing_assets(&aggregated, now).await;

        // Sinks run once everything is published, all assets concurrently.
        join_all(
            deliveries
                .into_iter()
                .map(|(price, trusted)| self.deliver(price, trusted)),
        )
        .await;

        *self.state.latest.write().await = aggregated.clone();

        let report = CycleReport {
            timestamp: now,
            quotes_gathered,
            assets_aggregated: aggregated.len(),
            breakers_tripped,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        *self.state.last_cycle.write().await = Some(report.clone());

        info!(
            "Oracle cycle: {} quotes, {} assets, {} tripped ({}ms)",
            report.quotes_gathered,
            report.assets_aggregated,
            report.breakers_tripped,
            report.duration_ms
        );

        Some(report)
    }

    /// Breaker, TWAP and publish for one asset. Returns whether the price is
    /// trusted.
    async fn process_asset(&self, price: &AggregatedPrice, now: i64) -> bool {
        let asset = price.asset.as_str();

        let (breaker, alerts) = {
            let mut breakers = self.state.breakers.lock().await;
            let seq = breakers.alert_seq();
            let state = breakers.check(asset, price.median_price, price.sources.len(), now);
            if let Some(reason) = breakers.trip_reason(asset) {
                debug!("{} withheld: {}", asset, reason.to_error(asset));
            }
            (state, breakers.alerts_since(seq))
        };
        let trusted = !breaker.is_tripped;

        let twap = {
            let mut twap = self.state.twap.lock().await;
            if trusted {
                match twap.update(asset, price.median_price, now) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!("TWAP update for {} failed: {}", asset, e);
                        twap.get(asset)
                    }
                }
            } else {
                twap.get(asset)
            }
        };

        for alert in alerts {
            self.broadcaster
                .publish(&alert_topic(asset), OracleEvent::Alert(alert));
        }

        debug!(
            "{}: ${:.4} from {} sources (conf {:.3}, trusted: {})",
            asset,
            price.median_price,
            price.sources.len(),
            price.confidence,
            trusted
        );
        self.broadcaster.publish(
            &price_topic(asset),
            OracleEvent::Price(PricePublication {
                price: price.clone(),
                twap,
                breaker,
                trusted,
            }),
        );

        trusted
    }

    /// Run the breaker for every previously observed asset that has no
    /// surviving quotes this cycle. Returns how many of them are tripped.
    async fn check_missing_assets(
        &self,
        aggregated: &BTreeMap<String, AggregatedPrice>,
        now: i64,
    ) -> usize {
        let (states, alerts) = {
            let mut breakers = self.state.breakers.lock().await;
            let seq = breakers.alert_seq();
            let missing: Vec<String> = breakers
                .states()
                .into_iter()
                .map(|state| state.asset)
                .filter(|asset| !aggregated.contains_key(asset))
                .collect();
            let states: Vec<BreakerState> = missing
                .iter()
                .filter_map(|asset| breakers.check_missing(asset, now))
                .collect();
            (states, breakers.alerts_since(seq))
        };

        for state in &states {
            debug!("{} has no surviving quotes this cycle", state.asset);
        }
        for alert in alerts {
            let topic = alert_topic(&alert.asset);
            self.broadcaster.publish(&topic, OracleEvent::Alert(alert));
        }

        states.iter().filter(|state| state.is_tripped).count()
    }

    /// Persist every price and settle the trusted ones.
    async fn deliver(&self, price: &AggregatedPrice, trusted: bool) {
        self.persist(price).await;
        if trusted {
            self.sync_settlement(price).await;
        }
    }

    async fn gather(&self, now: i64) -> Vec<RawQuote> {
        let source_timeout = self.config.source_timeout;
        let fetches = self.sources.iter().map(|source| async move {
            let result = match timeout(source_timeout, source.fetch(now)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(source_timeout)),
            };
            (source.name().to_string(), result)
        });
        let results = join_all(fetches).await;

        let mut quotes = Vec::new();
        {
            let mut statuses = self.state.sources.write().await;
            for (name, result) in results {
                let status = statuses
                    .entry(name.clone())
                    .or_insert_with(|| SourceStatus::new(name.clone(), SourceKind::Rest));
                match result {
                    Ok(fetched) => {
                        debug!("{} returned {} quotes", name, fetched.len());
                        status.up = true;
                        status.quotes_last_cycle = fetched.len();
                        status.consecutive_failures = 0;
                        status.last_success = Some(now);
                        status.last_error = None;
                        quotes.extend(fetched);
                    }
                    Err(e) => {
                        let err = OracleError::SourceUnavailable {
                            source_name: name.clone(),
                            reason: e.to_string(),
                        };
                        warn!("{}", err);
                        status.up = false;
                        status.quotes_last_cycle = 0;
                        status.consecutive_failures += 1;
                        status.last_error = Some(e.to_string());
                    }
                }
            }
        }

        quotes.extend(self.drain_stream(now).await);

        let nav_quotes = self.nav.quotes(now).await;
        {
            let mut statuses = self.state.sources.write().await;
            let status = statuses
                .entry(NAV_SOURCE.to_string())
                .or_insert_with(|| SourceStatus::new(NAV_SOURCE, SourceKind::Manual));
            status.up = true;
            status.quotes_last_cycle = nav_quotes.len();
            if !nav_quotes.is_empty() {
                status.last_success = Some(now);
            }
        }
        quotes.extend(nav_quotes);

        quotes
    }

    /// Take every quote streamed since the last cycle.
    async fn drain_stream(&self, now: i64) -> Vec<RawQuote> {
        let mut rx_slot = self.stream_rx.lock().await;
        let Some(rx) = rx_slot.as_mut() else {
            return Vec::new();
        };

        let mut quotes = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut closed = false;
        let mut statuses = self.state.sources.write().await;

        loop {
            match rx.try_recv() {
                Ok(StreamEvent::Quote(quote)) => {
                    *counts.entry(quote.source.clone()).or_default() += 1;
                    quotes.push(quote);
                }
                Ok(StreamEvent::Connected { source }) => {
                    let status = stream_status(&mut statuses, &source);
                    status.up = true;
                    status.last_error = None;
                }
                Ok(StreamEvent::Disconnected { source }) => {
                    stream_status(&mut statuses, &source).up = false;
                }
                Ok(StreamEvent::Error { source, message }) => {
                    let status = stream_status(&mut statuses, &source);
                    status.up = false;
                    status.consecutive_failures += 1;
                    status.last_error = Some(message);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        for status in statuses.values_mut().filter(|s| s.kind == SourceKind::Stream) {
            status.quotes_last_cycle = counts.remove(&status.name).unwrap_or(0);
            if status.quotes_last_cycle > 0 {
                status.up = true;
                status.consecutive_failures = 0;
                status.last_success = Some(now);
            }
            if closed {
                status.up = false;
                status.last_error = Some("stream channel closed".to_string());
            }
        }
        // Quotes from streams nobody registered.
        for (source, count) in counts {
            let status = stream_status(&mut statuses, &source);
            status.up = true;
            status.quotes_last_cycle = count;
            status.last_success = Some(now);
        }

        if closed {
            warn!("Stream channel closed, no more streamed quotes");
            *rx_slot = None;
        }

        quotes
    }

    async fn persist(&self, price: &AggregatedPrice) {
        let Some(store) = &self.store else {
            return;
        };

        let source = price.sources.join("+");
        let result = timeout(
            self.config.sink_timeout,
            store.append(
                &price.asset,
                price.median_price,
                price.confidence,
                &source,
                price.timestamp,
            ),
        )
        .await;

        let reason = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.config.sink_timeout),
        };
        warn!(
            "{}",
            OracleError::PersistenceFailure {
                asset: price.asset.clone(),
                reason,
            }
        );
    }

    async fn sync_settlement(&self, price: &AggregatedPrice) {
        if !self.config.settlement_sync {
            return;
        }
        let Some(settlement) = &self.settlement else {
            return;
        };

        let reason = match timeout(self.config.sink_timeout, settlement.sync(price)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.config.sink_timeout),
        };
        warn!(
            "{}",
            OracleError::SettlementSyncFailure {
                asset: price.asset.clone(),
                reason,
            }
        );
    }

    /// Most recent consensus price per asset from the last completed cycle.
    pub async fn latest_prices(&self) -> BTreeMap<String, AggregatedPrice> {
        self.state.latest.read().await.clone()
    }

    /// Current TWAP state for one asset.
    pub async fn twap(&self, asset: &str) -> Option<TwapState> {
        self.state.twap.lock().await.get(asset)
    }

    pub async fn breaker_states(&self) -> Vec<BreakerState> {
        self.state.breakers.lock().await.states()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.breakers.lock().await.alerts()
    }

    /// Manually clear an asset's breaker. `None` if the asset was never observed.
    pub async fn reset_circuit_breaker(&self, asset: &str) -> Option<BreakerState> {
        let now = chrono::Utc::now().timestamp();
        let (state, alerts) = {
            let mut breakers = self.state.breakers.lock().await;
            let seq = breakers.alert_seq();
            let state = breakers.reset(asset, now)?;
            (state, breakers.alerts_since(seq))
        };

        for alert in alerts {
            self.broadcaster
                .publish(&alert_topic(asset), OracleEvent::Alert(alert));
        }
        Some(state)
    }

    pub async fn clear_twap_data(&self) {
        self.state.twap.lock().await.clear();
    }

    /// Health, per-source status, prices and breakers for operators.
    pub async fn status(&self) -> OracleStatus {
        let sources: Vec<SourceStatus> = self.state.sources.read().await.values().cloned().collect();
        let prices: Vec<AggregatedPrice> = self.state.latest.read().await.values().cloned().collect();
        let breakers = self.state.breakers.lock().await.states();
        let last_cycle = self.state.last_cycle.read().await.clone();

        let source_down = sources
            .iter()
            .any(|s| s.kind != SourceKind::Manual && !s.up);
        let breaker_tripped = breakers.iter().any(|b| b.is_tripped);

        let health = if prices.is_empty() {
            HealthLevel::Down
        } else if source_down || breaker_tripped {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };

        OracleStatus {
            health,
            sources,
            prices,
            breakers,
            last_cycle,
        }
    }

    /// Start the recurring cycle timer.
    ///
    /// Each tick runs in its own task so a slow cycle cannot delay the timer;
    /// the cycle lock makes an overlapping tick a no-op.
    pub fn start(self: &Arc<Self>) -> OracleHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let oracle = Arc::clone(self);
        let period = self.config.cycle_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight = JoinSet::new();

            info!("Oracle started, cycle every {:?}", period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let oracle = Arc::clone(&oracle);
                        in_flight.spawn(async move {
                            oracle.run_cycle().await;
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    _ = shutdown_rx.changed() => break,
                }
            }

            // Let in-flight cycles finish so no asset is left half-updated.
            while in_flight.join_next().await.is_some() {}
            info!("Oracle timer stopped");
        });

        OracleHandle { shutdown_tx, task }
    }
}

fn stream_status<'a>(
    statuses: &'a mut BTreeMap<String, SourceStatus>,
    source: &str,
) -> &'a mut SourceStatus {
    statuses
        .entry(source.to_string())
        .or_insert_with(|| SourceStatus::new(source, SourceKind::Stream))
}

/// Handle to a running oracle timer.
pub struct OracleHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OracleHandle {
    /// Stop the timer and wait for any in-flight cycle to complete.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Oracle timer task failed: {}", e);
        }
        info!("Oracle shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use consensus_oracle_core::NavEntry;
    use consensus_oracle_types::AlertKind;
    use tokio::sync::broadcast;

    use crate::broadcast::TopicMessage;

    const NOW: i64 = 1_700_000_000;

    /// Quotes the given prices at the cycle's clock (minus `age_secs`, or a
    /// per-asset age set with `set_age`).
    struct StaticSource {
        name: String,
        prices: std::sync::Mutex<Vec<(String, f64)>>,
        age_secs: i64,
        ages: std::sync::Mutex<HashMap<String, i64>>,
    }

    impl StaticSource {
        fn new(name: &str, prices: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                prices: std::sync::Mutex::new(
                    prices.iter().map(|(a, p)| (a.to_string(), *p)).collect(),
                ),
                age_secs: 0,
                ages: std::sync::Mutex::new(HashMap::new()),
            })
        }

        fn stale(name: &str, prices: &[(&str, f64)], age_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                prices: std::sync::Mutex::new(
                    prices.iter().map(|(a, p)| (a.to_string(), *p)).collect(),
                ),
                age_secs,
                ages: std::sync::Mutex::new(HashMap::new()),
            })
        }

        fn set_price(&self, asset: &str, price: f64) {
            let mut prices = self.prices.lock().unwrap();
            prices.retain(|(a, _)| a != asset);
            prices.push((asset.to_string(), price));
        }

        fn set_age(&self, asset: &str, age_secs: i64) {
            self.ages.lock().unwrap().insert(asset.to_string(), age_secs);
        }
    }

    #[async_trait]
    impl PriceSource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, now: i64) -> Result<Vec<RawQuote>, SourceError> {
            let ages = self.ages.lock().unwrap();
            Ok(self
                .prices
                .lock()
                .unwrap()
                .iter()
                .map(|(asset, price)| {
                    let age = ages.get(asset).copied().unwrap_or(self.age_secs);
                    RawQuote::new(asset, *price, &self.name, now - age, 0.9)
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch(&self, now: i64) -> Result<Vec<RawQuote>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawQuote::new("SOL", 150.0, "counting", now, 0.9)])
        }
    }

    struct FailingSource;

    #[async_trait]
    impl PriceSource for FailingSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch(&self, _now: i64) -> Result<Vec<RawQuote>, SourceError> {
            Err(SourceError::Other("connection refused".to_string()))
        }
    }

    struct SlowSource {
        delay: Duration,
    }

    #[async_trait]
    impl PriceSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, now: i64) -> Result<Vec<RawQuote>, SourceError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![RawQuote::new("BTC", 60000.0, "slow", now, 0.9)])
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        rows: std::sync::Mutex<Vec<(String, f64, String)>>,
    }

    #[async_trait]
    impl PriceStore for RecordingStore {
        async fn append(
            &self,
            asset: &str,
            price: f64,
            _confidence: f64,
            source: &str,
            _timestamp: i64,
        ) -> anyhow::Result<()> {
            self.rows
                .lock()
                .unwrap()
                .push((asset.to_string(), price, source.to_string()));
            Ok(())
        }
    }

    /// Records how many appends were in flight at once.
    #[derive(Default)]
    struct ConcurrentStore {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl PriceStore for ConcurrentStore {
        async fn append(&self, _: &str, _: f64, _: f64, _: &str, _: i64) -> anyhow::Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl PriceStore for FailingStore {
        async fn append(&self, _: &str, _: f64, _: f64, _: &str, _: i64) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingSettlement {
        synced: AtomicUsize,
    }

    #[async_trait]
    impl SettlementSync for RecordingSettlement {
        async fn sync(&self, _price: &AggregatedPrice) -> anyhow::Result<()> {
            self.synced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> OracleConfig {
        OracleConfig {
            source_timeout: Duration::from_millis(200),
            sink_timeout: Duration::from_millis(200),
            nav_prices: Vec::new(),
            ..OracleConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TopicMessage>) -> Vec<TopicMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn publication(message: &TopicMessage) -> &PricePublication {
        match &message.event {
            OracleEvent::Price(publication) => publication,
            other => panic!("expected price event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_sources_median_published() {
        let broadcaster = Arc::new(ChannelBroadcaster::default());
        let mut rx = broadcaster.subscribe();
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
            .source(StaticSource::new("beta", &[("BTC", 61000.0)]))
            .broadcaster(broadcaster.clone())
            .build()
            .unwrap();

        let report = oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(report.assets_aggregated, 1);
        assert_eq!(report.breakers_tripped, 0);

        let latest = oracle.latest_prices().await;
        assert_eq!(latest["BTC"].median_price, 60500.0);
        assert_eq!(latest["BTC"].sources.len(), 2);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "prices:BTC");
        let published = publication(&messages[0]);
        assert!(published.trusted);
        assert!(!published.breaker.is_tripped);
        assert_eq!(published.twap.as_ref().unwrap().price_5m, Some(60500.0));

        let breakers = oracle.breaker_states().await;
        assert_eq!(breakers.len(), 1);
        assert!(!breakers[0].is_tripped);
    }

    #[tokio::test]
    async fn test_failing_source_does_not_fail_cycle() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0), ("ETH", 3000.0)]))
            .source(Arc::new(FailingSource))
            .build()
            .unwrap();

        let report = oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(report.assets_aggregated, 2);

        let status = oracle.status().await;
        assert_eq!(status.health, HealthLevel::Degraded);
        assert_eq!(status.prices.len(), 2);

        let broken = status.sources.iter().find(|s| s.name == "broken").unwrap();
        assert!(!broken.up);
        assert_eq!(broken.consecutive_failures, 1);
        assert!(broken.last_error.as_deref().unwrap().contains("connection refused"));

        let alpha = status.sources.iter().find(|s| s.name == "alpha").unwrap();
        assert!(alpha.up);
        assert_eq!(alpha.quotes_last_cycle, 2);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("ETH", 3000.0)]))
            .source(Arc::new(SlowSource {
                delay: Duration::from_secs(5),
            }))
            .build()
            .unwrap();

        let report = oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(report.assets_aggregated, 1);
        assert!(!oracle.latest_prices().await.contains_key("BTC"));

        let status = oracle.status().await;
        let slow = status.sources.iter().find(|s| s.name == "slow").unwrap();
        assert!(!slow.up);
        assert!(slow.last_error.as_deref().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_healthy_when_all_sources_up() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("SOL", 150.0)]))
            .build()
            .unwrap();

        assert_eq!(oracle.status().await.health, HealthLevel::Down);
        oracle.run_cycle_at(NOW).await.unwrap();

        let status = oracle.status().await;
        assert_eq!(status.health, HealthLevel::Healthy);
        assert_eq!(status.last_cycle.unwrap().timestamp, NOW);
    }

    #[tokio::test]
    async fn test_stale_source_excluded() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
            .source(StaticSource::stale("lagging", &[("BTC", 1.0), ("ETH", 3000.0)], 600))
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();

        let latest = oracle.latest_prices().await;
        assert_eq!(latest["BTC"].median_price, 60000.0);
        assert_eq!(latest["BTC"].sources, vec!["alpha".to_string()]);
        assert!(!latest.contains_key("ETH"));
    }

    #[tokio::test]
    async fn test_malformed_quotes_dropped() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", f64::NAN), ("ETH", 3000.0)]))
            .source(StaticSource::new("beta", &[("BTC", -1.0)]))
            .build()
            .unwrap();

        let report = oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(report.quotes_gathered, 3);

        let latest = oracle.latest_prices().await;
        assert!(!latest.contains_key("BTC"));
        assert!(latest.contains_key("ETH"));
    }

    #[tokio::test]
    async fn test_breaker_trip_withholds_trust_and_twap() {
        let broadcaster = Arc::new(ChannelBroadcaster::default());
        let mut rx = broadcaster.subscribe();
        let source = StaticSource::new("alpha", &[("BTC", 60000.0)]);
        let oracle = Oracle::builder(config())
            .source(source.clone())
            .broadcaster(broadcaster.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        drain(&mut rx);

        source.set_price("BTC", 75000.0);
        let report = oracle.run_cycle_at(NOW + 30).await.unwrap();
        assert_eq!(report.breakers_tripped, 1);

        let messages = drain(&mut rx);
        let alert = messages.iter().find(|m| m.topic == "alerts:BTC").unwrap();
        assert!(matches!(
            &alert.event,
            OracleEvent::Alert(a) if a.kind == AlertKind::CircuitBreakerTrip
        ));

        let price_message = messages.iter().find(|m| m.topic == "prices:BTC").unwrap();
        let published = publication(price_message);
        assert!(!published.trusted);
        assert_eq!(published.price.median_price, 75000.0);
        assert_eq!(published.breaker.last_valid_price, 60000.0);
        assert!(published.breaker.reason.as_deref().unwrap().contains("deviation"));
        assert_eq!(published.twap.as_ref().unwrap().sample_count, 1);

        // Observation continues while tripped
        assert_eq!(oracle.latest_prices().await["BTC"].median_price, 75000.0);
        assert_eq!(oracle.status().await.health, HealthLevel::Degraded);

        // Hysteresis: a normal-looking price does not recover early
        source.set_price("BTC", 60100.0);
        oracle.run_cycle_at(NOW + 60).await.unwrap();
        assert!(oracle.breaker_states().await[0].is_tripped);

        let reset = oracle.reset_circuit_breaker("BTC").await.unwrap();
        assert!(!reset.is_tripped);
        assert_eq!(reset.last_valid_price, 60000.0);

        let kinds: Vec<AlertKind> = oracle.alerts().await.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::CircuitBreakerTrip, AlertKind::CircuitBreakerRecover]
        );
        let recover = drain(&mut rx);
        assert!(recover.iter().any(|m| m.topic == "alerts:BTC"));
    }

    #[tokio::test]
    async fn test_reset_unknown_asset() {
        let oracle = Oracle::builder(config()).build().unwrap();
        assert!(oracle.reset_circuit_breaker("DOGE").await.is_none());
        assert!(oracle.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_sources_trip() {
        let oracle = Oracle::builder(OracleConfig {
            min_sources: 2,
            ..config()
        })
        .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
        .source(StaticSource::new("beta", &[("BTC", 60010.0), ("ETH", 3000.0)]))
        .build()
        .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        // ETH is first observed with one source: anchors, never trips
        assert!(oracle.breaker_states().await.iter().all(|b| !b.is_tripped));

        let report = oracle.run_cycle_at(NOW + 30).await.unwrap();
        assert_eq!(report.breakers_tripped, 1);

        let eth = oracle
            .breaker_states()
            .await
            .into_iter()
            .find(|b| b.asset == "ETH")
            .unwrap();
        assert!(eth.is_tripped);
        assert!(eth.reason.unwrap().contains("Insufficient sources"));
    }

    #[tokio::test]
    async fn test_nav_table_prices_asset() {
        let nav = NavTable::with_entries([(
            "USTB".to_string(),
            NavEntry::new(10.42, 1.0, NAV_SOURCE),
        )]);
        let oracle = Oracle::builder(config())
            .source(Arc::new(FailingSource))
            .nav_table(nav.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(oracle.latest_prices().await["USTB"].median_price, 10.42);

        // Admin edits are picked up on the next cycle
        nav.set("USTB", NavEntry::new(10.45, 1.0, NAV_SOURCE)).await;
        oracle.run_cycle_at(NOW + 30).await.unwrap();
        assert_eq!(oracle.latest_prices().await["USTB"].median_price, 10.45);

        let status = oracle.status().await;
        let manual = status.sources.iter().find(|s| s.kind == SourceKind::Manual).unwrap();
        assert_eq!(manual.quotes_last_cycle, 1);
    }

    #[tokio::test]
    async fn test_streamed_quotes_merged() {
        let (tx, rx) = mpsc::channel(16);
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
            .stream(&["stream"], rx)
            .build()
            .unwrap();

        tx.send(StreamEvent::Connected {
            source: "stream".to_string(),
        })
        .await
        .unwrap();
        tx.send(StreamEvent::Quote(RawQuote::new("BTC", 60800.0, "stream", NOW - 20, 0.9)))
            .await
            .unwrap();
        tx.send(StreamEvent::Quote(RawQuote::new("BTC", 61000.0, "stream", NOW - 5, 0.9)))
            .await
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();

        let latest = oracle.latest_prices().await;
        assert_eq!(latest["BTC"].median_price, 60500.0);
        assert_eq!(latest["BTC"].sources.len(), 2);

        let status = oracle.status().await;
        let stream = status.sources.iter().find(|s| s.name == "stream").unwrap();
        assert!(stream.up);
        assert_eq!(stream.quotes_last_cycle, 2);

        drop(tx);
        oracle.run_cycle_at(NOW + 30).await.unwrap();
        let status = oracle.status().await;
        let stream = status.sources.iter().find(|s| s.name == "stream").unwrap();
        assert!(!stream.up);
        assert_eq!(stream.quotes_last_cycle, 0);
    }

    #[tokio::test]
    async fn test_store_and_settlement() {
        let store = Arc::new(RecordingStore::default());
        let settlement = Arc::new(RecordingSettlement::default());
        let source = StaticSource::new("alpha", &[("BTC", 60000.0)]);
        let oracle = Oracle::builder(OracleConfig {
            settlement_sync: true,
            ..config()
        })
        .source(source.clone())
        .source(StaticSource::new("beta", &[("BTC", 60000.0)]))
        .store(store.clone())
        .settlement(settlement.clone())
        .build()
        .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        {
            let rows = store.rows.lock().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0], ("BTC".to_string(), 60000.0, "alpha+beta".to_string()));
        }
        assert_eq!(settlement.synced.load(Ordering::SeqCst), 1);

        // Tripped prices are recorded but never settled
        source.set_price("BTC", 90000.0);
        oracle.run_cycle_at(NOW + 30).await.unwrap();
        assert_eq!(store.rows.lock().unwrap().len(), 2);
        assert_eq!(settlement.synced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settlement_disabled_by_config() {
        let settlement = Arc::new(RecordingSettlement::default());
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
            .settlement(settlement.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(settlement.synced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_cycle() {
        let oracle = Oracle::builder(config())
            .source(StaticSource::new("alpha", &[("BTC", 60000.0)]))
            .store(Arc::new(FailingStore))
            .build()
            .unwrap();

        let report = oracle.run_cycle_at(NOW).await.unwrap();
        assert_eq!(report.assets_aggregated, 1);
        assert_eq!(oracle.latest_prices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_skipped() {
        let oracle = Oracle::builder(OracleConfig {
            source_timeout: Duration::from_secs(5),
            ..config()
        })
        .source(Arc::new(SlowSource {
            delay: Duration::from_millis(100),
        }))
        .build()
        .unwrap();

        let (first, second) = tokio::join!(oracle.run_cycle_at(NOW), oracle.run_cycle_at(NOW));

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_twap_accumulates_and_clears() {
        let source = StaticSource::new("alpha", &[("ETH", 3000.0)]);
        let oracle = Oracle::builder(config())
            .source(source.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        source.set_price("ETH", 3030.0);
        oracle.run_cycle_at(NOW + 30).await.unwrap();

        let twap = oracle.twap("ETH").await.unwrap();
        assert_eq!(twap.sample_count, 2);
        assert_eq!(twap.price_5m, Some(3000.0));

        oracle.clear_twap_data().await;
        assert!(oracle.twap("ETH").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let result = Oracle::builder(OracleConfig {
            deviation_threshold: 0.0,
            ..config()
        })
        .build();

        match result {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("invalid config accepted"),
        }
    }

    #[tokio::test]
    async fn test_vanished_asset_trips_breaker() {
        let broadcaster = Arc::new(ChannelBroadcaster::default());
        let mut rx = broadcaster.subscribe();
        let source = StaticSource::new("alpha", &[("BTC", 60000.0), ("ETH", 3000.0)]);
        let oracle = Oracle::builder(config())
            .source(source.clone())
            .broadcaster(broadcaster.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();
        drain(&mut rx);

        // Source still up, but its BTC quote has gone stale
        source.set_age("BTC", 900);
        let report = oracle.run_cycle_at(NOW + 30).await.unwrap();
        assert_eq!(report.assets_aggregated, 1);
        assert_eq!(report.breakers_tripped, 1);
        assert!(!oracle.latest_prices().await.contains_key("BTC"));

        let status = oracle.status().await;
        assert_eq!(status.health, HealthLevel::Degraded);
        let btc = status.breakers.iter().find(|b| b.asset == "BTC").unwrap();
        assert!(btc.is_tripped);
        assert_eq!(btc.last_valid_price, 60000.0);
        assert_eq!(btc.reason.as_deref(), Some("Insufficient sources: 0 < 1"));

        let messages = drain(&mut rx);
        let alert = messages.iter().find(|m| m.topic == "alerts:BTC").unwrap();
        assert!(matches!(
            &alert.event,
            OracleEvent::Alert(a) if a.kind == AlertKind::CircuitBreakerTrip
        ));
        assert!(!messages.iter().any(|m| m.topic == "prices:BTC"));

        // Still missing: no repeated alerts
        oracle.run_cycle_at(NOW + 60).await.unwrap();
        assert_eq!(oracle.alerts().await.len(), 1);

        // Feed returns after the recovery window
        source.set_age("BTC", 0);
        oracle.run_cycle_at(NOW + 330).await.unwrap();
        let btc = oracle
            .breaker_states()
            .await
            .into_iter()
            .find(|b| b.asset == "BTC")
            .unwrap();
        assert!(!btc.is_tripped);
        let kinds: Vec<AlertKind> = oracle.alerts().await.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::CircuitBreakerTrip, AlertKind::CircuitBreakerRecover]
        );
    }

    #[tokio::test]
    async fn test_sinks_run_concurrently_across_assets() {
        let store = Arc::new(ConcurrentStore::default());
        let oracle = Oracle::builder(config())
            .source(StaticSource::new(
                "alpha",
                &[("BTC", 60000.0), ("ETH", 3000.0), ("SOL", 150.0)],
            ))
            .store(store.clone())
            .build()
            .unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();

        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nan_nav_confidence_never_reaches_output() {
        let nav = NavTable::with_entries([
            ("USTB".to_string(), NavEntry::new(10.42, f64::NAN, NAV_SOURCE)),
            ("OUSG".to_string(), NavEntry::new(105.3, 0.95, NAV_SOURCE)),
        ]);
        let oracle = Oracle::builder(config()).nav_table(nav).build().unwrap();

        oracle.run_cycle_at(NOW).await.unwrap();

        let latest = oracle.latest_prices().await;
        assert!(!latest.contains_key("USTB"));
        let confidence = latest["OUSG"].confidence;
        assert!(confidence > 0.0 && confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_timer_runs_and_shuts_down() {
        let source = Arc::new(CountingSource::default());
        let oracle = Arc::new(
            Oracle::builder(OracleConfig {
                cycle_interval: Duration::from_millis(20),
                ..config()
            })
            .source(source.clone())
            .build()
            .unwrap(),
        );

        let handle = oracle.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert!(oracle.latest_prices().await.contains_key("SOL"));
        let fetches = source.fetches.load(Ordering::SeqCst);
        assert!(fetches >= 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetches);
    }
}
