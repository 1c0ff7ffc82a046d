//! Canonical, chain-agnostic records persisted by the index.
//!
//! Every record is scoped by a (chain, network) key prefix; see `keys`.
//! Amounts are `u128` base units (satoshis, wei) so account-chain values fit.

use chainidx_params::Hash256;
use chainidx_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use chainidx_primitives::{OutPoint, U256};

pub type Amount = u128;

const SPENT_MINIMUM: i64 = 0;
const SPENT_PENDING: i64 = -1;
const SPENT_UNSPENT: i64 = -2;
const SPENT_CONFLICTING: i64 = -3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub height: u64,
    pub version: u32,
    pub previous_block_hash: Hash256,
    pub next_block_hash: Option<Hash256>,
    pub time: u64,
    /// Monotonic block time: `max(time, parent.time_normalized + 1)`.
    pub time_normalized: u64,
    pub merkle_root: Hash256,
    pub bits: u32,
    pub nonce: u64,
    pub transaction_count: u32,
    pub size: u64,
    pub reward: Amount,
    /// Cumulative work up to and including this block, big-endian.
    pub chainwork: Option<[u8; 32]>,
    pub processed: bool,
}

impl BlockRecord {
    pub fn chainwork(&self) -> Option<U256> {
        self.chainwork.as_ref().map(|bytes| U256::from_big_endian(bytes))
    }
}

impl Encodable for BlockRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u64_le(self.height);
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.previous_block_hash);
        encoder.write_opt_hash(self.next_block_hash.as_ref());
        encoder.write_u64_le(self.time);
        encoder.write_u64_le(self.time_normalized);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.bits);
        encoder.write_u64_le(self.nonce);
        encoder.write_u32_le(self.transaction_count);
        encoder.write_u64_le(self.size);
        encoder.write_u128_le(self.reward);
        encoder.write_opt_hash(self.chainwork.as_ref());
        encoder.write_bool(self.processed);
    }
}

impl Decodable for BlockRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            hash: decoder.read_hash()?,
            height: decoder.read_u64_le()?,
            version: decoder.read_u32_le()?,
            previous_block_hash: decoder.read_hash()?,
            next_block_hash: decoder.read_opt_hash()?,
            time: decoder.read_u64_le()?,
            time_normalized: decoder.read_u64_le()?,
            merkle_root: decoder.read_hash()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u64_le()?,
            transaction_count: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            reward: decoder.read_u128_le()?,
            chainwork: decoder.read_opt_hash()?,
            processed: decoder.read_bool()?,
        })
    }
}

/// Where a transaction currently sits relative to the canonical chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxPosition {
    Confirmed {
        block_hash: Hash256,
        block_height: u64,
    },
    Pending,
    Conflicting,
}

impl TxPosition {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxPosition::Confirmed { .. })
    }

    pub fn block_hash(&self) -> Option<Hash256> {
        match self {
            TxPosition::Confirmed { block_hash, .. } => Some(*block_hash),
            _ => None,
        }
    }

    pub fn block_height(&self) -> Option<u64> {
        match self {
            TxPosition::Confirmed { block_height, .. } => Some(*block_height),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutputSummary {
    pub value: Amount,
    pub address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxDetail {
    Utxo {
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutputSummary>,
    },
    Account {
        from: String,
        to: Option<String>,
        nonce: u64,
        gas_limit: u64,
        gas_price: Amount,
    },
}

impl TxDetail {
    /// Addresses this transaction pays to or sends from, as known without coin lookups.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = match self {
            TxDetail::Utxo { outputs, .. } => outputs
                .iter()
                .filter_map(|output| output.address.clone())
                .collect(),
            TxDetail::Account { from, to, .. } => {
                let mut out = vec![from.clone()];
                out.extend(to.iter().cloned());
                out
            }
        };
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub txid: Hash256,
    pub position: TxPosition,
    pub index_in_block: u32,
    pub block_time: u64,
    pub block_time_normalized: u64,
    pub coinbase: bool,
    pub fee: Option<Amount>,
    pub value: Amount,
    pub size: u32,
    pub locktime: u32,
    pub detail: TxDetail,
    pub wallets: Vec<String>,
}

impl Encodable for TransactionRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        match &self.position {
            TxPosition::Confirmed {
                block_hash,
                block_height,
            } => {
                encoder.write_u8(0);
                encoder.write_hash(block_hash);
                encoder.write_u64_le(*block_height);
            }
            TxPosition::Pending => encoder.write_u8(1),
            TxPosition::Conflicting => encoder.write_u8(2),
        }
        encoder.write_u32_le(self.index_in_block);
        encoder.write_u64_le(self.block_time);
        encoder.write_u64_le(self.block_time_normalized);
        encoder.write_bool(self.coinbase);
        write_opt_amount(encoder, self.fee);
        encoder.write_u128_le(self.value);
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.locktime);
        match &self.detail {
            TxDetail::Utxo { inputs, outputs } => {
                encoder.write_u8(0);
                encoder.write_varint(inputs.len() as u64);
                for input in inputs {
                    input.consensus_encode(encoder);
                }
                encoder.write_varint(outputs.len() as u64);
                for output in outputs {
                    encoder.write_u128_le(output.value);
                    write_opt_str(encoder, output.address.as_deref());
                }
            }
            TxDetail::Account {
                from,
                to,
                nonce,
                gas_limit,
                gas_price,
            } => {
                encoder.write_u8(1);
                encoder.write_var_str(from);
                write_opt_str(encoder, to.as_deref());
                encoder.write_u64_le(*nonce);
                encoder.write_u64_le(*gas_limit);
                encoder.write_u128_le(*gas_price);
            }
        }
        write_strings(encoder, &self.wallets);
    }
}

impl Decodable for TransactionRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let position = match decoder.read_u8()? {
            0 => TxPosition::Confirmed {
                block_hash: decoder.read_hash()?,
                block_height: decoder.read_u64_le()?,
            },
            1 => TxPosition::Pending,
            2 => TxPosition::Conflicting,
            _ => return Err(DecodeError::InvalidData("invalid tx position tag")),
        };
        let index_in_block = decoder.read_u32_le()?;
        let block_time = decoder.read_u64_le()?;
        let block_time_normalized = decoder.read_u64_le()?;
        let coinbase = decoder.read_bool()?;
        let fee = read_opt_amount(decoder)?;
        let value = decoder.read_u128_le()?;
        let size = decoder.read_u32_le()?;
        let locktime = decoder.read_u32_le()?;
        let detail = match decoder.read_u8()? {
            0 => {
                let input_count = decoder.read_count()?;
                let mut inputs = Vec::with_capacity(input_count.min(1024));
                for _ in 0..input_count {
                    inputs.push(OutPoint::consensus_decode(decoder)?);
                }
                let output_count = decoder.read_count()?;
                let mut outputs = Vec::with_capacity(output_count.min(1024));
                for _ in 0..output_count {
                    outputs.push(TxOutputSummary {
                        value: decoder.read_u128_le()?,
                        address: read_opt_str(decoder)?,
                    });
                }
                TxDetail::Utxo { inputs, outputs }
            }
            1 => TxDetail::Account {
                from: decoder.read_var_str()?,
                to: read_opt_str(decoder)?,
                nonce: decoder.read_u64_le()?,
                gas_limit: decoder.read_u64_le()?,
                gas_price: decoder.read_u128_le()?,
            },
            _ => return Err(DecodeError::InvalidData("invalid tx detail tag")),
        };
        let wallets = read_strings(decoder)?;
        Ok(Self {
            txid,
            position,
            index_in_block,
            block_time,
            block_time_normalized,
            coinbase,
            fee,
            value,
            size,
            locktime,
            detail,
            wallets,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MintHeight {
    Confirmed(u64),
    Pending,
    Conflicting,
}

impl MintHeight {
    fn to_disk(self) -> i64 {
        match self {
            MintHeight::Confirmed(height) => clamp_height(height),
            MintHeight::Pending => SPENT_PENDING,
            MintHeight::Conflicting => SPENT_CONFLICTING,
        }
    }

    fn from_disk(raw: i64) -> Result<Self, DecodeError> {
        match raw {
            height if height >= SPENT_MINIMUM => Ok(MintHeight::Confirmed(height as u64)),
            SPENT_PENDING => Ok(MintHeight::Pending),
            SPENT_CONFLICTING => Ok(MintHeight::Conflicting),
            _ => Err(DecodeError::InvalidData("invalid mint height")),
        }
    }
}

/// Spend state of a coin. Stored with the classic sentinels:
/// unspent = -2, pending = -1, conflicting = -3, confirmed = height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpentState {
    Unspent,
    Pending { txid: Hash256, index: u32 },
    Conflicting { txid: Hash256, index: u32 },
    Confirmed { txid: Hash256, index: u32, height: u64 },
}

impl SpentState {
    pub fn spender(&self) -> Option<(Hash256, u32)> {
        match *self {
            SpentState::Unspent => None,
            SpentState::Pending { txid, index }
            | SpentState::Conflicting { txid, index }
            | SpentState::Confirmed { txid, index, .. } => Some((txid, index)),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, SpentState::Confirmed { .. })
    }
}

impl Encodable for SpentState {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        let height = match self {
            SpentState::Unspent => SPENT_UNSPENT,
            SpentState::Pending { .. } => SPENT_PENDING,
            SpentState::Conflicting { .. } => SPENT_CONFLICTING,
            SpentState::Confirmed { height, .. } => clamp_height(*height),
        };
        encoder.write_i64_le(height);
        if let Some((txid, index)) = self.spender() {
            encoder.write_hash(&txid);
            encoder.write_u32_le(index);
        }
    }
}

impl Decodable for SpentState {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let height = decoder.read_i64_le()?;
        if height == SPENT_UNSPENT {
            return Ok(SpentState::Unspent);
        }
        let txid = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        match height {
            SPENT_PENDING => Ok(SpentState::Pending { txid, index }),
            SPENT_CONFLICTING => Ok(SpentState::Conflicting { txid, index }),
            height if height >= SPENT_MINIMUM => Ok(SpentState::Confirmed {
                txid,
                index,
                height: height as u64,
            }),
            _ => Err(DecodeError::InvalidData("invalid spent height")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinRecord {
    pub outpoint: OutPoint,
    pub mint_height: MintHeight,
    pub coinbase: bool,
    pub value: Amount,
    pub address: Option<String>,
    pub script: Vec<u8>,
    pub spent: SpentState,
    pub wallets: Vec<String>,
}

impl CoinRecord {
    /// Counted in balances: not spent by a confirmed transaction, not minted by a conflicting one.
    pub fn is_spendable(&self) -> bool {
        !self.spent.is_confirmed() && self.mint_height != MintHeight::Conflicting
    }
}

impl Encodable for CoinRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.outpoint.consensus_encode(encoder);
        encoder.write_i64_le(self.mint_height.to_disk());
        encoder.write_bool(self.coinbase);
        encoder.write_u128_le(self.value);
        write_opt_str(encoder, self.address.as_deref());
        encoder.write_var_bytes(&self.script);
        self.spent.consensus_encode(encoder);
        write_strings(encoder, &self.wallets);
    }
}

impl Decodable for CoinRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            outpoint: OutPoint::consensus_decode(decoder)?,
            mint_height: MintHeight::from_disk(decoder.read_i64_le()?)?,
            coinbase: decoder.read_bool()?,
            value: decoder.read_u128_le()?,
            address: read_opt_str(decoder)?,
            script: decoder.read_var_bytes()?,
            spent: SpentState::consensus_decode(decoder)?,
            wallets: read_strings(decoder)?,
        })
    }
}

/// One input of a transaction consuming a coin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpendLink {
    pub outpoint: OutPoint,
    pub spender_txid: Hash256,
    pub spender_index: u32,
    /// `None` while the spending transaction is unconfirmed.
    pub height: Option<u64>,
}

impl SpendLink {
    pub fn state(&self) -> SpentState {
        match self.height {
            Some(height) => SpentState::Confirmed {
                txid: self.spender_txid,
                index: self.spender_index,
                height,
            },
            None => SpentState::Pending {
                txid: self.spender_txid,
                index: self.spender_index,
            },
        }
    }
}

/// Membership of an address in a wallet, maintained outside the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletAddress {
    pub wallet: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub updated_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.updated_ms) < self.ttl_ms
    }
}

impl Encodable for CacheEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.updated_ms);
        encoder.write_u64_le(self.ttl_ms);
        encoder.write_var_bytes(&self.value);
    }
}

impl Decodable for CacheEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let updated_ms = decoder.read_u64_le()?;
        let ttl_ms = decoder.read_u64_le()?;
        let value = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            updated_ms,
            ttl_ms,
        })
    }
}

fn clamp_height(height: u64) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

fn write_opt_amount(encoder: &mut Encoder, value: Option<Amount>) {
    match value {
        Some(value) => {
            encoder.write_u8(1);
            encoder.write_u128_le(value);
        }
        None => encoder.write_u8(0),
    }
}

fn read_opt_amount(decoder: &mut Decoder) -> Result<Option<Amount>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => decoder.read_u128_le().map(Some),
        _ => Err(DecodeError::InvalidData("invalid option tag")),
    }
}

fn write_opt_str(encoder: &mut Encoder, value: Option<&str>) {
    match value {
        Some(value) => {
            encoder.write_u8(1);
            encoder.write_var_str(value);
        }
        None => encoder.write_u8(0),
    }
}

fn read_opt_str(decoder: &mut Decoder) -> Result<Option<String>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => decoder.read_var_str().map(Some),
        _ => Err(DecodeError::InvalidData("invalid option tag")),
    }
}

fn write_strings(encoder: &mut Encoder, values: &[String]) {
    encoder.write_varint(values.len() as u64);
    for value in values {
        encoder.write_var_str(value);
    }
}

fn read_strings(decoder: &mut Decoder) -> Result<Vec<String>, DecodeError> {
    let count = decoder.read_count()?;
    let mut out = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        out.push(decoder.read_var_str()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainidx_primitives::encoding::{decode, encode};

    #[test]
    fn spent_state_uses_sentinels() {
        let unspent = encode(&SpentState::Unspent);
        assert_eq!(unspent, (-2i64).to_le_bytes().to_vec());

        let pending = SpentState::Pending {
            txid: [1u8; 32],
            index: 4,
        };
        let bytes = encode(&pending);
        assert_eq!(&bytes[..8], &(-1i64).to_le_bytes());
        assert_eq!(decode::<SpentState>(&bytes), Ok(pending));

        let conflicting = SpentState::Conflicting {
            txid: [2u8; 32],
            index: 0,
        };
        assert_eq!(&encode(&conflicting)[..8], &(-3i64).to_le_bytes());
    }

    #[test]
    fn coin_record_decodes_what_it_encodes() {
        let coin = CoinRecord {
            outpoint: OutPoint::new([5u8; 32], 1),
            mint_height: MintHeight::Pending,
            coinbase: false,
            value: 42,
            address: Some("addr".to_string()),
            script: vec![0x51],
            spent: SpentState::Confirmed {
                txid: [6u8; 32],
                index: 0,
                height: 12,
            },
            wallets: vec!["w1".to_string()],
        };
        assert_eq!(decode::<CoinRecord>(&encode(&coin)), Ok(coin));
    }

    #[test]
    fn cache_entry_freshness() {
        let entry = CacheEntry {
            value: b"1".to_vec(),
            updated_ms: 1_000,
            ttl_ms: 60_000,
        };
        assert!(entry.is_fresh(60_999));
        assert!(!entry.is_fresh(61_000));
    }
}
