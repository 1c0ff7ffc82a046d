//! Fee estimation from recently confirmed transactions.
//!
//! Samples are sorted highest first; the confirmation target picks a quartile
//! (target 1 is the most expensive quarter, 4 and above the cheapest) and the
//! estimate is that quartile's median.

use chainidx_index::{Amount, TransactionRecord, TxDetail};
use chainidx_params::ChainKey;
use serde::{Deserialize, Serialize};

/// Most recent confirmed transactions sampled per estimate.
pub const FEE_SAMPLE_SIZE: usize = 4_000;
const WEI_PER_CENTI_GWEI: u128 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeUnit {
    SatPerKb,
    Wei,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub fee_rate: Amount,
    pub unit: FeeUnit,
    pub blocks: u32,
    pub samples: usize,
}

pub fn fee_cache_key(key: &ChainKey, target: u32, mode: Option<&str>) -> String {
    match mode {
        Some(mode) => format!("getFee-{}-{}-{target}-{mode}", key.chain, key.network),
        None => format!("getFee-{}-{}-{target}", key.chain, key.network),
    }
}

/// Median of the quartile selected by `target` over `sorted_desc`.
pub fn quartile_median(sorted_desc: &[Amount], target: u32) -> Amount {
    if sorted_desc.is_empty() {
        return 0;
    }
    let quartile = match target {
        0 => 1,
        target => target.min(4) as usize,
    };
    let len = sorted_desc.len();
    let start = (len * (quartile - 1) / 4).min(len - 1);
    let end = (len * quartile / 4).clamp(start + 1, len);
    let slice = &sorted_desc[start..end];
    let mid = slice.len() / 2;
    if slice.len() % 2 == 0 {
        slice[mid - 1] / 2 + slice[mid] / 2 + (slice[mid - 1] % 2 + slice[mid] % 2) / 2
    } else {
        slice[mid]
    }
}

/// Rounds wei to the nearest hundredth of a gwei.
pub fn round_to_centi_gwei(wei: Amount) -> Amount {
    wei.saturating_add(WEI_PER_CENTI_GWEI / 2) / WEI_PER_CENTI_GWEI * WEI_PER_CENTI_GWEI
}

/// Fee rates in base units per 1000 bytes, highest first. Coinbases and
/// transactions without a known fee are skipped.
pub fn utxo_fee_rates(txs: &[TransactionRecord]) -> Vec<Amount> {
    let mut rates: Vec<Amount> = txs
        .iter()
        .filter(|tx| !tx.coinbase && tx.size > 0)
        .filter_map(|tx| tx.fee.map(|fee| fee.saturating_mul(1_000) / Amount::from(tx.size)))
        .filter(|rate| *rate > 0)
        .collect();
    rates.sort_unstable_by(|a, b| b.cmp(a));
    rates
}

pub fn account_gas_prices(txs: &[TransactionRecord]) -> Vec<Amount> {
    let mut prices: Vec<Amount> = txs
        .iter()
        .filter_map(|tx| match &tx.detail {
            TxDetail::Account { gas_price, .. } if *gas_price > 0 => Some(*gas_price),
            _ => None,
        })
        .collect();
    prices.sort_unstable_by(|a, b| b.cmp(a));
    prices
}
