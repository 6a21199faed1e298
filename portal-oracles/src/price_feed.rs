//! Feeder price aggregation.
//!
//! Authorised feeders submit price tables during a block; at the end of the
//! block each asset settles on the median of what was submitted. Assets nobody
//! reported keep their previous price.

use portal_types::state::{ExchangeRatesSubmission, FinalExchangeRates};
use std::collections::BTreeMap;
use tracing::debug;

/// Median of a sorted, non-empty slice. Even counts take the truncated mean
/// of the two middle values.
pub fn median(sorted: &[u64]) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        let sum = sorted[mid - 1] as u128 + sorted[mid] as u128;
        Some((sum / 2) as u64)
    } else {
        Some(sorted[mid])
    }
}

/// Builds the next final table from the previous one and this block's
/// submissions. Returns `None` when there is neither.
pub fn aggregate_final_rates<'a, I>(
    previous: Option<&FinalExchangeRates>,
    submissions: I,
) -> Option<FinalExchangeRates>
where
    I: IntoIterator<Item = &'a ExchangeRatesSubmission>,
{
    let mut reported: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for submission in submissions {
        for (asset, price) in &submission.rates {
            if *price > 0 {
                reported.entry(asset.clone()).or_default().push(*price);
            }
        }
    }

    if reported.is_empty() {
        return previous.cloned();
    }

    let mut next = previous.cloned().unwrap_or_default();
    for (asset, mut prices) in reported {
        prices.sort_unstable();
        if let Some(price) = median(&prices) {
            debug!("Final rate for {}: {} from {} reports", asset, price, prices.len());
            next.rates.insert(asset, price);
        }
    }
    Some(next)
}
