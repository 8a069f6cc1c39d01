//! Median aggregator.
//!
//! Reduces every source's quotes for an asset into a single consensus price.
//! The median is used rather than a mean so that one bad feed cannot drag
//! the consensus away from the honest majority.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use consensus_oracle_types::{AggregatedPrice, RawQuote};

/// Default maximum quote age in seconds (5 minutes).
pub const DEFAULT_STALENESS_SECS: i64 = 5 * 60;

/// How much a single fully-confident source contributes to consensus confidence.
const SOURCE_CONFIDENCE_WEIGHT: f64 = 0.6;

/// Lower bound so a surviving asset never reports zero confidence.
const MIN_CONFIDENCE: f64 = 0.01;

/// Median of `prices`; 0.0 for an empty slice.
pub fn calculate_median(prices: &[f64]) -> f64 {
    if prices.is_empty() {
        return 0.0;
    }

    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Consensus confidence for a set of per-source confidences.
///
/// Each source independently "vouches" for the price with probability
/// `0.6 * c`; the result is the chance at least one of them is right. Adding
/// a source can therefore never lower the score.
pub fn consensus_confidence(source_confidences: &[f64]) -> f64 {
    if source_confidences.is_empty() {
        return 0.0;
    }

    let doubt: f64 = source_confidences
        .iter()
        .map(|c| {
            let c = if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 };
            1.0 - SOURCE_CONFIDENCE_WEIGHT * c
        })
        .product();

    (1.0 - doubt).clamp(MIN_CONFIDENCE, 1.0)
}

/// Aggregate quotes for any number of assets into one price per asset.
///
/// Invalid and stale quotes are dropped; when a source reports an asset more
/// than once only its newest quote counts. Assets left with no quotes are
/// absent from the result.
pub fn aggregate_prices(
    quotes: &[RawQuote],
    staleness_secs: i64,
    now: i64,
) -> BTreeMap<String, AggregatedPrice> {
    // asset -> source -> newest quote
    let mut grouped: BTreeMap<&str, HashMap<&str, &RawQuote>> = BTreeMap::new();

    for quote in quotes {
        if !quote.is_valid() {
            debug!(
                "Dropping invalid quote from {} for {}: {}",
                quote.source, quote.asset, quote.price
            );
            continue;
        }
        let age = now.saturating_sub(quote.timestamp);
        if age > staleness_secs {
            debug!(
                "Dropping stale quote from {} for {} ({}s old)",
                quote.source, quote.asset, age
            );
            continue;
        }

        let by_source = grouped.entry(quote.asset.as_str()).or_default();
        let is_newest = by_source
            .get(quote.source.as_str())
            .map_or(true, |existing| existing.timestamp <= quote.timestamp);
        if is_newest {
            by_source.insert(quote.source.as_str(), quote);
        }
    }

    grouped
        .into_iter()
        .map(|(asset, by_source)| {
            let mut survivors: Vec<&RawQuote> = by_source.into_values().collect();
            survivors.sort_by(|a, b| a.source.cmp(&b.source));

            let prices: Vec<f64> = survivors.iter().map(|q| q.price).collect();
            let confidences: Vec<f64> = survivors.iter().map(|q| q.confidence).collect();

            let aggregated = AggregatedPrice {
                asset: asset.to_string(),
                median_price: calculate_median(&prices),
                sources: survivors.iter().map(|q| q.source.clone()).collect(),
                confidence: consensus_confidence(&confidences),
                timestamp: now,
            };

            (asset.to_string(), aggregated)
        })
        .collect()
}
