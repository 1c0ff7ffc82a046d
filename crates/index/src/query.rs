use std::collections::HashMap;

use chainidx_params::{ChainKey, Hash256};
use chainidx_storage::{Column, KeyValueStore};

use crate::error::IndexError;
use crate::keys::{trailing_outpoint, trailing_txid, Keys};
use crate::records::{CoinRecord, MintHeight, SpentState, TransactionRecord, TxPosition};
use crate::store::IndexStore;

/// Selects transactions. Block filters take precedence over address, then wallet.
#[derive(Clone, Debug, Default)]
pub struct TxFilter {
    pub block_hash: Option<Hash256>,
    pub block_height: Option<u64>,
    pub address: Option<String>,
    pub wallet: Option<String>,
    pub limit: Option<usize>,
}

/// Coins a transaction consumed and created, in input and output order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxCoins {
    pub inputs: Vec<CoinRecord>,
    pub outputs: Vec<CoinRecord>,
}

/// Checks confirmed positions against the canonical height slots. Rows written
/// for a block only count as confirmed once that block holds its height.
pub(crate) struct CanonicalView<'a, S: ?Sized> {
    index: &'a IndexStore<S>,
    key: &'a ChainKey,
    slots: HashMap<u64, Option<Hash256>>,
}

impl<'a, S: KeyValueStore + ?Sized> CanonicalView<'a, S> {
    pub(crate) fn new(index: &'a IndexStore<S>, key: &'a ChainKey) -> Self {
        Self {
            index,
            key,
            slots: HashMap::new(),
        }
    }

    pub(crate) fn slot(&mut self, height: u64) -> Result<Option<Hash256>, IndexError> {
        if let Some(slot) = self.slots.get(&height) {
            return Ok(*slot);
        }
        let slot = self.index.canonical_hash(self.key, height)?;
        self.slots.insert(height, slot);
        Ok(slot)
    }

    /// Pending and conflicting positions are always visible.
    pub(crate) fn visible(&mut self, position: &TxPosition) -> Result<bool, IndexError> {
        match *position {
            TxPosition::Confirmed {
                block_hash,
                block_height,
            } => Ok(self.slot(block_height)? == Some(block_hash)),
            TxPosition::Pending | TxPosition::Conflicting => Ok(true),
        }
    }

    pub(crate) fn confirmed(&mut self, txid: &Hash256) -> Result<bool, IndexError> {
        match self.index.transaction(self.key, txid)? {
            Some(tx) if tx.position.is_confirmed() => self.visible(&tx.position),
            _ => Ok(false),
        }
    }

    /// `None` while the minting block is not canonical. A confirmed spend from a
    /// block that is not canonical reads as pending.
    pub(crate) fn coin(&mut self, mut coin: CoinRecord) -> Result<Option<CoinRecord>, IndexError> {
        if matches!(coin.mint_height, MintHeight::Confirmed(_)) && !self.confirmed(&coin.outpoint.txid)? {
            return Ok(None);
        }
        if let SpentState::Confirmed { txid, index, .. } = coin.spent {
            if !self.confirmed(&txid)? {
                coin.spent = SpentState::Pending { txid, index };
            }
        }
        Ok(Some(coin))
    }
}

impl<S: KeyValueStore + ?Sized> IndexStore<S> {
    pub fn transaction(
        &self,
        key: &ChainKey,
        txid: &Hash256,
    ) -> Result<Option<TransactionRecord>, IndexError> {
        self.read(Column::Transactions, &Keys::new(key).transaction(txid))
    }

    /// Like `transaction`, but hidden while its block is not processed.
    pub fn visible_transaction(
        &self,
        key: &ChainKey,
        txid: &Hash256,
    ) -> Result<Option<TransactionRecord>, IndexError> {
        let Some(tx) = self.transaction(key, txid)? else {
            return Ok(None);
        };
        if CanonicalView::new(self, key).visible(&tx.position)? {
            Ok(Some(tx))
        } else {
            Ok(None)
        }
    }

    /// `None` when the transaction is unknown or not yet visible.
    pub fn coins_for_tx(&self, key: &ChainKey, txid: &Hash256) -> Result<Option<TxCoins>, IndexError> {
        if self.visible_transaction(key, txid)?.is_none() {
            return Ok(None);
        }
        let keys = Keys::new(key);
        let mut view = CanonicalView::new(self, key);
        let mut coins = TxCoins::default();
        for (_, spent) in self
            .kv()
            .scan_prefix(Column::CoinsBySpender, &keys.spender_prefix(txid))?
        {
            let Some(outpoint) = trailing_outpoint(&spent) else {
                continue;
            };
            if let Some(coin) = self.read::<CoinRecord>(Column::Coins, &keys.coin(&outpoint))? {
                coins.inputs.extend(view.coin(coin)?);
            }
        }
        for (_, bytes) in self.kv().scan_prefix(Column::Coins, &keys.coins_of_tx(txid))? {
            let coin = chainidx_primitives::decode::<CoinRecord>(&bytes)?;
            coins.outputs.extend(view.coin(coin)?);
        }
        Ok(Some(coins))
    }

    pub fn transactions(
        &self,
        key: &ChainKey,
        filter: &TxFilter,
    ) -> Result<Vec<TransactionRecord>, IndexError> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        if filter.block_hash.is_some() || filter.block_height.is_some() {
            let block = match (filter.block_hash, filter.block_height) {
                (Some(hash), _) => self.block_by_hash(key, &hash)?,
                (None, Some(height)) => self.block_by_height(key, height)?,
                (None, None) => None,
            };
            return match block {
                // Unprocessed blocks are not yet part of the canonical view.
                Some(block) if block.processed => {
                    let mut out = self.block_transactions(key, &block.hash)?;
                    out.truncate(limit);
                    Ok(out)
                }
                _ => Ok(Vec::new()),
            };
        }

        let keys = Keys::new(key);
        let (column, prefix) = match (&filter.address, &filter.wallet) {
            (Some(address), _) => (Column::TxByAddress, keys.labelled_prefix(address)),
            (None, Some(wallet)) => (Column::TxByWallet, keys.labelled_prefix(wallet)),
            (None, None) => (Column::Transactions, keys.prefix().to_vec()),
        };
        let mut view = CanonicalView::new(self, key);
        let mut out = Vec::new();
        for (entry, value) in self.kv().scan_prefix(column, &prefix)? {
            let tx = if column == Column::Transactions {
                chainidx_primitives::decode::<TransactionRecord>(&value)?
            } else {
                let Some(txid) = trailing_txid(&entry) else {
                    continue;
                };
                match self.transaction(key, &txid)? {
                    Some(tx) => tx,
                    None => continue,
                }
            };
            if view.visible(&tx.position)? {
                out.push(tx);
            }
        }
        // Newest first; unconfirmed transactions lead.
        out.sort_by_key(|tx| std::cmp::Reverse(tx.position.block_height().unwrap_or(u64::MAX)));
        out.truncate(limit);
        Ok(out)
    }

    fn block_transactions(
        &self,
        key: &ChainKey,
        block_hash: &Hash256,
    ) -> Result<Vec<TransactionRecord>, IndexError> {
        let keys = Keys::new(key);
        let mut out = Vec::new();
        for (entry, _) in self
            .kv()
            .scan_prefix(Column::TxByBlock, &keys.tx_by_block_prefix(block_hash))?
        {
            let Some(txid) = trailing_txid(&entry) else {
                continue;
            };
            match self.transaction(key, &txid)? {
                Some(tx) if tx.position.block_hash() == Some(*block_hash) => out.push(tx),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Confirmed non-coinbase transactions from the newest canonical blocks,
    /// skipping the genesis block, until `limit` are collected.
    pub fn recent_confirmed_transactions(
        &self,
        key: &ChainKey,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, IndexError> {
        let Some(tip) = self.get_local_tip(key)? else {
            return Ok(Vec::new());
        };
        let base = self.base_height(key)?.unwrap_or(0);
        let mut out = Vec::new();
        let mut height = tip.height;
        while height > 0 && height >= base && out.len() < limit {
            if let Some(hash) = self.canonical_hash(key, height)? {
                out.extend(
                    self.block_transactions(key, &hash)?
                        .into_iter()
                        .filter(|tx| !tx.coinbase),
                );
            }
            height -= 1;
        }
        out.truncate(limit);
        Ok(out)
    }

    pub fn coins_for_address(
        &self,
        key: &ChainKey,
        address: &str,
        spendable_only: bool,
    ) -> Result<Vec<CoinRecord>, IndexError> {
        let keys = Keys::new(key);
        self.labelled_coins(key, Column::CoinsByAddress, &keys.labelled_prefix(address), spendable_only)
    }

    /// Unspent coins tagged with `wallet`.
    pub fn coins_for_wallet(&self, key: &ChainKey, wallet: &str) -> Result<Vec<CoinRecord>, IndexError> {
        let keys = Keys::new(key);
        self.labelled_coins(key, Column::CoinsByWallet, &keys.labelled_prefix(wallet), true)
    }

    fn labelled_coins(
        &self,
        key: &ChainKey,
        column: Column,
        prefix: &[u8],
        spendable_only: bool,
    ) -> Result<Vec<CoinRecord>, IndexError> {
        let keys = Keys::new(key);
        let mut view = CanonicalView::new(self, key);
        let mut out = Vec::new();
        for (entry, _) in self.kv().scan_prefix(column, prefix)? {
            let Some(outpoint) = trailing_outpoint(&entry) else {
                continue;
            };
            let Some(coin) = self.read::<CoinRecord>(Column::Coins, &keys.coin(&outpoint))? else {
                continue;
            };
            let Some(coin) = view.coin(coin)? else {
                continue;
            };
            if !spendable_only || coin.is_spendable() {
                out.push(coin);
            }
        }
        Ok(out)
    }
}
