//! Key layouts. Every key starts with the (chain, network) prefix so one store
//! holds any number of chains without collisions.
//!
//! Heights are big-endian so prefix scans walk them in order.

use chainidx_params::{ChainKey, Hash256};
use chainidx_primitives::OutPoint;

const WALLET_BY_ADDRESS: u8 = 0;
const ADDRESS_BY_WALLET: u8 = 1;
const SPENDER_LINK: u8 = 0;
const PARKED_SPEND: u8 = 1;
const META_BASE_HEIGHT: &[u8] = b"base_height";

pub(crate) struct Keys {
    prefix: Vec<u8>,
}

impl Keys {
    pub(crate) fn new(key: &ChainKey) -> Self {
        Self {
            prefix: key.prefix(),
        }
    }

    pub(crate) fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn with(&self, capacity: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + capacity);
        out.extend_from_slice(&self.prefix);
        out
    }

    pub(crate) fn block(&self, hash: &Hash256) -> Vec<u8> {
        let mut out = self.with(32);
        out.extend_from_slice(hash);
        out
    }

    pub(crate) fn height(&self, height: u64) -> Vec<u8> {
        let mut out = self.with(8);
        out.extend_from_slice(&height.to_be_bytes());
        out
    }

    pub(crate) fn transaction(&self, txid: &Hash256) -> Vec<u8> {
        self.block(txid)
    }

    pub(crate) fn tx_by_block_prefix(&self, block_hash: &Hash256) -> Vec<u8> {
        self.block(block_hash)
    }

    pub(crate) fn tx_by_block(&self, block_hash: &Hash256, index: u32, txid: &Hash256) -> Vec<u8> {
        let mut out = self.tx_by_block_prefix(block_hash);
        out.extend_from_slice(&index.to_be_bytes());
        out.extend_from_slice(txid);
        out
    }

    pub(crate) fn labelled_prefix(&self, label: &str) -> Vec<u8> {
        let bytes = label.as_bytes();
        let mut out = self.with(2 + bytes.len());
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
        out
    }

    /// Used for tx-by-address and tx-by-wallet.
    pub(crate) fn labelled_tx(&self, label: &str, txid: &Hash256) -> Vec<u8> {
        let mut out = self.labelled_prefix(label);
        out.extend_from_slice(txid);
        out
    }

    /// Used for coins-by-address and coins-by-wallet.
    pub(crate) fn labelled_coin(&self, label: &str, outpoint: &OutPoint) -> Vec<u8> {
        let mut out = self.labelled_prefix(label);
        push_outpoint(&mut out, outpoint);
        out
    }

    pub(crate) fn coin(&self, outpoint: &OutPoint) -> Vec<u8> {
        let mut out = self.with(36);
        push_outpoint(&mut out, outpoint);
        out
    }

    pub(crate) fn coins_of_tx(&self, txid: &Hash256) -> Vec<u8> {
        self.block(txid)
    }

    pub(crate) fn spender_prefix(&self, spender_txid: &Hash256) -> Vec<u8> {
        let mut out = self.with(33);
        out.push(SPENDER_LINK);
        out.extend_from_slice(spender_txid);
        out
    }

    pub(crate) fn spender(&self, spender_txid: &Hash256, index: u32) -> Vec<u8> {
        let mut out = self.spender_prefix(spender_txid);
        out.extend_from_slice(&index.to_be_bytes());
        out
    }

    /// Spend recorded before the coin it consumes was written.
    pub(crate) fn parked_spend(&self, outpoint: &OutPoint) -> Vec<u8> {
        let mut out = self.with(37);
        out.push(PARKED_SPEND);
        push_outpoint(&mut out, outpoint);
        out
    }

    pub(crate) fn wallets_of_address_prefix(&self, address: &str) -> Vec<u8> {
        let mut out = self.with(1);
        out.push(WALLET_BY_ADDRESS);
        push_label(&mut out, address);
        out
    }

    pub(crate) fn wallet_of_address(&self, address: &str, wallet: &str) -> Vec<u8> {
        let mut out = self.wallets_of_address_prefix(address);
        push_label(&mut out, wallet);
        out
    }

    pub(crate) fn addresses_of_wallet_prefix(&self, wallet: &str) -> Vec<u8> {
        let mut out = self.with(1);
        out.push(ADDRESS_BY_WALLET);
        push_label(&mut out, wallet);
        out
    }

    pub(crate) fn address_of_wallet(&self, wallet: &str, address: &str) -> Vec<u8> {
        let mut out = self.addresses_of_wallet_prefix(wallet);
        push_label(&mut out, address);
        out
    }

    pub(crate) fn base_height(&self) -> Vec<u8> {
        let mut out = self.with(META_BASE_HEIGHT.len());
        out.extend_from_slice(META_BASE_HEIGHT);
        out
    }
}

fn push_outpoint(out: &mut Vec<u8>, outpoint: &OutPoint) {
    out.extend_from_slice(&outpoint.txid);
    out.extend_from_slice(&outpoint.index.to_be_bytes());
}

fn push_label(out: &mut Vec<u8>, label: &str) {
    out.extend_from_slice(&(label.len() as u16).to_be_bytes());
    out.extend_from_slice(label.as_bytes());
}

/// Trailing label written by `push_label`.
pub(crate) fn trailing_label(key: &[u8], prefix_len: usize) -> Option<String> {
    let rest = key.get(prefix_len..)?;
    let len = usize::from(u16::from_be_bytes(rest.get(..2)?.try_into().ok()?));
    let bytes = rest.get(2..2 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

pub(crate) fn trailing_txid(key: &[u8]) -> Option<Hash256> {
    let start = key.len().checked_sub(32)?;
    key.get(start..)?.try_into().ok()
}

pub(crate) fn trailing_outpoint(key: &[u8]) -> Option<OutPoint> {
    let start = key.len().checked_sub(36)?;
    let raw = key.get(start..)?;
    let txid: Hash256 = raw[..32].try_into().ok()?;
    let index = u32::from_be_bytes(raw[32..].try_into().ok()?);
    Some(OutPoint::new(txid, index))
}

pub(crate) fn outpoint_bytes(outpoint: &OutPoint) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    push_outpoint(&mut out, outpoint);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainidx_params::Network;

    #[test]
    fn chains_do_not_share_prefixes() {
        let btc = Keys::new(&ChainKey::new("BTC", Network::Mainnet));
        let btc_test = Keys::new(&ChainKey::new("BTC", Network::Testnet));
        let bch = Keys::new(&ChainKey::new("BCH", Network::Mainnet));
        assert_ne!(btc.height(1), btc_test.height(1));
        assert!(!bch.height(1).starts_with(btc.prefix()));
    }

    #[test]
    fn heights_sort_numerically() {
        let keys = Keys::new(&ChainKey::new("ETH", Network::Mainnet));
        assert!(keys.height(255) < keys.height(256));
        assert!(keys.height(65_535) < keys.height(70_000));
    }

    #[test]
    fn labels_are_recoverable() {
        let keys = Keys::new(&ChainKey::new("BTC", Network::Mainnet));
        let key = keys.wallet_of_address("1abc", "wallet-9");
        let prefix = keys.wallets_of_address_prefix("1abc");
        assert_eq!(trailing_label(&key, prefix.len()).as_deref(), Some("wallet-9"));
        let coin = keys.coin(&OutPoint::new([3u8; 32], 7));
        assert_eq!(trailing_outpoint(&coin), Some(OutPoint::new([3u8; 32], 7)));
    }
}
