use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chainidx_log::{log_debug, log_warn};
use chainidx_params::{hash256_to_hex, ChainKey, Hash256};
use chainidx_primitives::encoding::{decode, encode, Decodable};
use chainidx_primitives::OutPoint;
use chainidx_storage::{Column, KeyValueStore, Precondition, WriteBatch};

use crate::error::IndexError;
use crate::keys::{outpoint_bytes, trailing_label, trailing_outpoint, trailing_txid, Keys};
use crate::records::{
    BlockRecord, CoinRecord, MintHeight, SpendLink, SpentState, TransactionRecord, TxDetail,
    TxPosition, WalletAddress,
};

pub const MAX_LOCATOR_HASHES: usize = 500;
const DENSE_LOCATOR_HASHES: usize = 10;
const MAX_CAS_RETRIES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// A different block is already processed at this height.
    CandidateReorg { height: u64, processed_hash: Hash256 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContiguityReport {
    pub base_height: u64,
    pub tip_height: u64,
    pub blocks: u64,
}

pub struct IndexStore<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for IndexStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore + ?Sized> IndexStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn kv(&self) -> &Arc<S> {
        &self.store
    }

    pub(crate) fn read<T: Decodable>(
        &self,
        column: Column,
        key: &[u8],
    ) -> Result<Option<T>, IndexError> {
        match self.store.get(column, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads `reads`, lets `build` derive a batch from their current values, and
    /// commits it only if none of them changed meanwhile. Retries on conflict.
    fn conditional<F>(
        &self,
        what: &'static str,
        reads: &[(Column, Vec<u8>)],
        mut build: F,
    ) -> Result<bool, IndexError>
    where
        F: FnMut(&[Option<Vec<u8>>]) -> Result<Option<WriteBatch>, IndexError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut current = Vec::with_capacity(reads.len());
            for (column, key) in reads {
                current.push(self.store.get(*column, key)?);
            }
            let Some(batch) = build(&current)? else {
                return Ok(false);
            };
            let preconditions: Vec<Precondition> = reads
                .iter()
                .zip(current)
                .map(|((column, key), expected)| Precondition::new(*column, key.clone(), expected))
                .collect();
            if self.store.commit_if(&preconditions, &batch)? {
                return Ok(true);
            }
        }
        Err(IndexError::Contention(what))
    }

    pub fn block_by_hash(
        &self,
        key: &ChainKey,
        hash: &Hash256,
    ) -> Result<Option<BlockRecord>, IndexError> {
        self.read(Column::Blocks, &Keys::new(key).block(hash))
    }

    pub fn canonical_hash(&self, key: &ChainKey, height: u64) -> Result<Option<Hash256>, IndexError> {
        canonical_hash(&*self.store, &Keys::new(key), height)
    }

    /// Processed block at `height`, if any.
    pub fn block_by_height(
        &self,
        key: &ChainKey,
        height: u64,
    ) -> Result<Option<BlockRecord>, IndexError> {
        match self.canonical_hash(key, height)? {
            Some(hash) => self.block_by_hash(key, &hash),
            None => Ok(None),
        }
    }

    /// Height of the first block processed into an empty chain.
    pub fn base_height(&self, key: &ChainKey) -> Result<Option<u64>, IndexError> {
        let raw = self.store.get(Column::Meta, &Keys::new(key).base_height())?;
        Ok(raw.and_then(|bytes| Some(u64::from_be_bytes(bytes.as_slice().try_into().ok()?))))
    }

    pub fn upsert_block(
        &self,
        key: &ChainKey,
        block: &BlockRecord,
    ) -> Result<UpsertOutcome, IndexError> {
        let keys = Keys::new(key);
        let block_key = keys.block(&block.hash);
        let mut existed = false;
        self.conditional("block", &[(Column::Blocks, block_key.clone())], |current| {
            let mut record = block.clone();
            record.processed = false;
            record.next_block_hash = None;
            existed = false;
            if let Some(bytes) = &current[0] {
                let existing: BlockRecord = decode(bytes)?;
                record.processed = existing.processed;
                record.next_block_hash = existing.next_block_hash;
                existed = true;
            }
            let mut batch = WriteBatch::new();
            batch.put(Column::Blocks, block_key.clone(), encode(&record));
            Ok(Some(batch))
        })?;

        match canonical_hash(&*self.store, &keys, block.height)? {
            Some(processed_hash) if processed_hash != block.hash => {
                Ok(UpsertOutcome::CandidateReorg {
                    height: block.height,
                    processed_hash,
                })
            }
            _ if existed => Ok(UpsertOutcome::Updated),
            _ => Ok(UpsertOutcome::Inserted),
        }
    }

    pub fn upsert_transactions(
        &self,
        key: &ChainKey,
        txs: &[TransactionRecord],
    ) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        for tx in txs {
            let addresses = tx.detail.addresses();
            let address_wallets = self.wallets_for_addresses(key, &addresses)?;
            let tx_key = keys.transaction(&tx.txid);
            self.conditional("transaction", &[(Column::Transactions, tx_key.clone())], |current| {
                let existing = current[0]
                    .as_deref()
                    .map(decode::<TransactionRecord>)
                    .transpose()?;
                let mut record = tx.clone();
                let mut batch = WriteBatch::new();
                if let Some(existing) = &existing {
                    let moved = existing.position.block_hash().is_some()
                        && record.position.block_hash() != existing.position.block_hash();
                    if moved && self.confirmed_on_chain(key, &existing.position)? {
                        // A processed block keeps its transactions until it is orphaned.
                        record.position = existing.position;
                        record.index_in_block = existing.index_in_block;
                        record.block_time = existing.block_time;
                        record.block_time_normalized = existing.block_time_normalized;
                    }
                    if existing.position.is_confirmed() && !record.position.is_confirmed() {
                        // A mempool sighting never demotes a confirmed transaction.
                        record.position = existing.position;
                        record.index_in_block = existing.index_in_block;
                        record.block_time = existing.block_time;
                        record.block_time_normalized = existing.block_time_normalized;
                    }
                    if record.fee.is_none() {
                        record.fee = existing.fee;
                    }
                    merge_labels(&mut record.wallets, &existing.wallets);
                    if let Some(old_block) = existing.position.block_hash() {
                        if record.position.block_hash() != Some(old_block) {
                            batch.delete(
                                Column::TxByBlock,
                                keys.tx_by_block(&old_block, existing.index_in_block, &tx.txid),
                            );
                        }
                    }
                }
                merge_labels(&mut record.wallets, &address_wallets);
                if let Some(block_hash) = record.position.block_hash() {
                    batch.put(
                        Column::TxByBlock,
                        keys.tx_by_block(&block_hash, record.index_in_block, &tx.txid),
                        Vec::new(),
                    );
                }
                for address in &addresses {
                    batch.put(Column::TxByAddress, keys.labelled_tx(address, &tx.txid), Vec::new());
                }
                for wallet in &record.wallets {
                    batch.put(Column::TxByWallet, keys.labelled_tx(wallet, &tx.txid), Vec::new());
                }
                batch.put(Column::Transactions, tx_key.clone(), encode(&record));
                Ok(Some(batch))
            })?;
        }
        Ok(())
    }

    /// Mint fields are overwritten; spend state and wallet tags are preserved.
    pub fn upsert_coins(&self, key: &ChainKey, coins: &[CoinRecord]) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        for coin in coins {
            let address_wallets = match &coin.address {
                Some(address) => self.wallets_for_address(key, address)?,
                None => Vec::new(),
            };
            let coin_key = keys.coin(&coin.outpoint);
            let parked_key = keys.parked_spend(&coin.outpoint);
            let reads = [
                (Column::Coins, coin_key.clone()),
                (Column::CoinsBySpender, parked_key.clone()),
            ];
            self.conditional("coin", &reads, |current| {
                let mut record = coin.clone();
                let mut batch = WriteBatch::new();
                if let Some(bytes) = &current[0] {
                    let existing: CoinRecord = decode(bytes)?;
                    record.spent = existing.spent;
                    merge_labels(&mut record.wallets, &existing.wallets);
                } else if let Some(bytes) = &current[1] {
                    record.spent = decode(bytes)?;
                }
                if current[1].is_some() {
                    batch.delete(Column::CoinsBySpender, parked_key.clone());
                }
                merge_labels(&mut record.wallets, &address_wallets);
                if let Some(address) = &record.address {
                    batch.put(
                        Column::CoinsByAddress,
                        keys.labelled_coin(address, &record.outpoint),
                        Vec::new(),
                    );
                }
                for wallet in &record.wallets {
                    batch.put(
                        Column::CoinsByWallet,
                        keys.labelled_coin(wallet, &record.outpoint),
                        Vec::new(),
                    );
                }
                batch.put(Column::Coins, coin_key.clone(), encode(&record));
                Ok(Some(batch))
            })?;
        }
        Ok(())
    }

    /// Records spends against the coins they consume. A spend that arrives
    /// before its coin is parked and applied when the coin is written.
    pub fn apply_spends(&self, key: &ChainKey, spends: &[SpendLink]) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        let mut conflicting: BTreeSet<Hash256> = BTreeSet::new();
        let mut spenders: BTreeSet<Hash256> = BTreeSet::new();
        for spend in spends {
            spenders.insert(spend.spender_txid);
            let coin_key = keys.coin(&spend.outpoint);
            let parked_key = keys.parked_spend(&spend.outpoint);
            let link_key = keys.spender(&spend.spender_txid, spend.spender_index);
            let reads = [
                (Column::Coins, coin_key.clone()),
                (Column::CoinsBySpender, parked_key.clone()),
            ];
            let mut loser = None;
            self.conditional("spend", &reads, |current| {
                let mut batch = WriteBatch::new();
                batch.put(
                    Column::CoinsBySpender,
                    link_key.clone(),
                    outpoint_bytes(&spend.outpoint),
                );
                let Some(bytes) = &current[0] else {
                    let parked = current[1]
                        .as_deref()
                        .map(decode::<SpentState>)
                        .transpose()?
                        .unwrap_or(SpentState::Unspent);
                    let (state, lost) = resolve_spend(parked, spend);
                    loser = lost;
                    batch.put(Column::CoinsBySpender, parked_key.clone(), encode(&state));
                    return Ok(Some(batch));
                };
                let mut coin: CoinRecord = decode(bytes)?;
                if let (Some(height), MintHeight::Confirmed(mint_height)) =
                    (spend.height, coin.mint_height)
                {
                    if height < mint_height {
                        return Err(IndexError::SpendBeforeMint {
                            txid: spend.spender_txid,
                            height,
                            mint_height,
                        });
                    }
                }
                let mut current = coin.spent;
                if let SpentState::Confirmed { txid, index, .. } = current {
                    if spend.height.is_some()
                        && txid != spend.spender_txid
                        && self.confirmed_off_chain(key, &txid)?
                    {
                        current = SpentState::Pending { txid, index };
                    }
                }
                let (state, lost) = resolve_spend(current, spend);
                loser = lost;
                coin.spent = state;
                if let Some(address) = &coin.address {
                    batch.put(
                        Column::TxByAddress,
                        keys.labelled_tx(address, &spend.spender_txid),
                        Vec::new(),
                    );
                }
                for wallet in &coin.wallets {
                    batch.put(
                        Column::TxByWallet,
                        keys.labelled_tx(wallet, &spend.spender_txid),
                        Vec::new(),
                    );
                }
                batch.put(Column::Coins, coin_key.clone(), encode(&coin));
                Ok(Some(batch))
            })?;
            if let Some(loser) = loser {
                log_warn!(
                    chain: key,
                    "double spend of {}:{}; {} marked conflicting",
                    hash256_to_hex(&spend.outpoint.txid),
                    spend.outpoint.index,
                    hash256_to_hex(&loser)
                );
                conflicting.insert(loser);
            }
        }
        for txid in conflicting {
            self.mark_transaction_conflicting(key, &txid)?;
        }
        for txid in spenders {
            self.refresh_fee(key, &txid)?;
        }
        Ok(())
    }

    fn confirmed_on_chain(&self, key: &ChainKey, position: &TxPosition) -> Result<bool, IndexError> {
        match *position {
            TxPosition::Confirmed {
                block_hash,
                block_height,
            } => Ok(self.canonical_hash(key, block_height)? == Some(block_hash)),
            TxPosition::Pending | TxPosition::Conflicting => Ok(false),
        }
    }

    /// True when `txid` sits in a block whose height another block holds, or
    /// is no longer confirmed at all.
    fn confirmed_off_chain(&self, key: &ChainKey, txid: &Hash256) -> Result<bool, IndexError> {
        let Some(tx) = self.transaction(key, txid)? else {
            return Ok(false);
        };
        match tx.position {
            TxPosition::Confirmed {
                block_hash,
                block_height,
            } => Ok(matches!(
                self.canonical_hash(key, block_height)?,
                Some(holder) if holder != block_hash
            )),
            TxPosition::Pending | TxPosition::Conflicting => Ok(true),
        }
    }

    fn mark_transaction_conflicting(&self, key: &ChainKey, txid: &Hash256) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        self.conditional(
            "transaction",
            &[(Column::Transactions, keys.transaction(txid))],
            |current| {
                let Some(bytes) = &current[0] else {
                    return Ok(None);
                };
                let mut tx: TransactionRecord = decode(bytes)?;
                if tx.position != TxPosition::Pending {
                    return Ok(None);
                }
                tx.position = TxPosition::Conflicting;
                let mut batch = WriteBatch::new();
                batch.put(Column::Transactions, keys.transaction(txid), encode(&tx));
                Ok(Some(batch))
            },
        )?;
        for (coin_key, _) in self.store.scan_prefix(Column::Coins, &keys.coins_of_tx(txid))? {
            self.modify_coin(&coin_key, |coin| {
                if coin.mint_height == MintHeight::Pending {
                    coin.mint_height = MintHeight::Conflicting;
                    true
                } else {
                    false
                }
            })?;
        }
        Ok(())
    }

    /// Sets a UTXO transaction's fee once every input's coin is known.
    fn refresh_fee(&self, key: &ChainKey, txid: &Hash256) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        let tx_key = keys.transaction(txid);
        let Some(tx) = self.read::<TransactionRecord>(Column::Transactions, &tx_key)? else {
            return Ok(());
        };
        let TxDetail::Utxo { inputs, .. } = &tx.detail else {
            return Ok(());
        };
        if tx.coinbase || tx.fee.is_some() {
            return Ok(());
        }
        let mut input_value: u128 = 0;
        for outpoint in inputs {
            match self.read::<CoinRecord>(Column::Coins, &keys.coin(outpoint))? {
                Some(coin) => input_value = input_value.saturating_add(coin.value),
                None => return Ok(()),
            }
        }
        let fee = input_value.saturating_sub(tx.value);
        self.conditional("transaction", &[(Column::Transactions, tx_key.clone())], |current| {
            let Some(bytes) = &current[0] else {
                return Ok(None);
            };
            let mut tx: TransactionRecord = decode(bytes)?;
            tx.fee = Some(fee);
            let mut batch = WriteBatch::new();
            batch.put(Column::Transactions, tx_key.clone(), encode(&tx));
            Ok(Some(batch))
        })?;
        Ok(())
    }

    fn modify_coin<F>(&self, coin_key: &[u8], mut change: F) -> Result<(), IndexError>
    where
        F: FnMut(&mut CoinRecord) -> bool,
    {
        self.conditional("coin", &[(Column::Coins, coin_key.to_vec())], |current| {
            let Some(bytes) = &current[0] else {
                return Ok(None);
            };
            let mut coin: CoinRecord = decode(bytes)?;
            if !change(&mut coin) {
                return Ok(None);
            }
            let mut batch = WriteBatch::new();
            batch.put(Column::Coins, coin_key.to_vec(), encode(&coin));
            Ok(Some(batch))
        })?;
        Ok(())
    }

    /// Final write of a block's ingestion. Claims the block's canonical height
    /// and links it from its parent; the parent must already be processed
    /// unless the chain is empty.
    pub fn mark_processed(&self, key: &ChainKey, hash: &Hash256) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        let block_key = keys.block(hash);
        let block: BlockRecord = self
            .read(Column::Blocks, &block_key)?
            .ok_or(IndexError::BlockNotFound(*hash))?;
        let tip = self.get_local_tip(key)?;
        let parent_key = keys.block(&block.previous_block_hash);
        let height_key = keys.height(block.height);
        let base_key = keys.base_height();

        let reads = [
            (Column::Blocks, block_key.clone()),
            (Column::Blocks, parent_key.clone()),
            (Column::CanonicalHeight, height_key.clone()),
        ];
        self.conditional("canonical height", &reads, |current| {
            let Some(block_bytes) = &current[0] else {
                return Err(IndexError::BlockNotFound(*hash));
            };
            let mut block: BlockRecord = decode(block_bytes)?;
            if let Some(holder) = current[2].as_deref() {
                let holder: Hash256 = holder
                    .try_into()
                    .map_err(|_| IndexError::Contiguity("malformed height slot".to_string()))?;
                if holder == *hash && block.processed {
                    return Ok(None);
                }
                if holder != *hash {
                    return Err(IndexError::SlotTaken {
                        height: block.height,
                        holder,
                    });
                }
            }
            let mut batch = WriteBatch::new();
            let parent = current[1].as_deref().map(decode::<BlockRecord>).transpose()?;
            match (&tip, parent) {
                (None, _) => {
                    batch.put(Column::Meta, base_key.clone(), block.height.to_be_bytes());
                }
                (Some(_), Some(mut parent)) if parent.processed => {
                    if parent.height + 1 != block.height {
                        return Err(IndexError::HeightMismatch {
                            hash: *hash,
                            height: block.height,
                            parent_height: parent.height,
                        });
                    }
                    parent.next_block_hash = Some(*hash);
                    batch.put(Column::Blocks, parent_key.clone(), encode(&parent));
                }
                (Some(_), _) => return Err(IndexError::ParentNotProcessed(*hash)),
            }
            block.processed = true;
            batch.put(Column::Blocks, block_key.clone(), encode(&block));
            batch.put(Column::CanonicalHeight, height_key.clone(), hash.to_vec());
            Ok(Some(batch))
        })?;
        Ok(())
    }

    /// Highest processed block.
    pub fn get_local_tip(&self, key: &ChainKey) -> Result<Option<BlockRecord>, IndexError> {
        let keys = Keys::new(key);
        let Some((_, hash)) = self
            .store
            .last_with_prefix(Column::CanonicalHeight, keys.prefix())?
        else {
            return Ok(None);
        };
        let hash: Hash256 = hash
            .as_slice()
            .try_into()
            .map_err(|_| IndexError::Contiguity("malformed height slot".to_string()))?;
        self.read(Column::Blocks, &keys.block(&hash))
    }

    /// Detaches a processed block from the canonical chain. The row is kept.
    pub fn mark_orphaned(&self, key: &ChainKey, hash: &Hash256) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        let block_key = keys.block(hash);
        let block: BlockRecord = self
            .read(Column::Blocks, &block_key)?
            .ok_or(IndexError::BlockNotFound(*hash))?;
        let parent_key = keys.block(&block.previous_block_hash);
        let height_key = keys.height(block.height);
        let reads = [
            (Column::Blocks, block_key.clone()),
            (Column::Blocks, parent_key.clone()),
            (Column::CanonicalHeight, height_key.clone()),
        ];
        self.conditional("canonical height", &reads, |current| {
            let Some(block_bytes) = &current[0] else {
                return Ok(None);
            };
            let mut block: BlockRecord = decode(block_bytes)?;
            if !block.processed {
                return Ok(None);
            }
            let mut batch = WriteBatch::new();
            if current[2].as_deref() == Some(hash.as_slice()) {
                batch.delete(Column::CanonicalHeight, height_key.clone());
            }
            if let Some(bytes) = &current[1] {
                let mut parent: BlockRecord = decode(bytes)?;
                if parent.next_block_hash == Some(*hash) {
                    parent.next_block_hash = None;
                    batch.put(Column::Blocks, parent_key.clone(), encode(&parent));
                }
            }
            block.processed = false;
            block.next_block_hash = None;
            batch.put(Column::Blocks, block_key.clone(), encode(&block));
            Ok(Some(batch))
        })?;
        log_debug!(
            chain: key,
            "orphaned block {} at height {}",
            hash256_to_hex(hash),
            block.height
        );
        Ok(())
    }

    /// Returns the transactions of an orphaned block to the pending pool: the
    /// block link is cleared, minted coins become pending mints, and coins
    /// they spent become pending spends.
    pub fn unconfirm_block_transactions(
        &self,
        key: &ChainKey,
        hash: &Hash256,
    ) -> Result<usize, IndexError> {
        let keys = Keys::new(key);
        let entries = self
            .store
            .scan_prefix(Column::TxByBlock, &keys.tx_by_block_prefix(hash))?;
        for (entry_key, _) in &entries {
            let txid = trailing_txid(entry_key)
                .ok_or_else(|| IndexError::Contiguity("malformed tx-by-block key".to_string()))?;
            let tx_key = keys.transaction(&txid);
            let mut detached = false;
            self.conditional("transaction", &[(Column::Transactions, tx_key.clone())], |current| {
                let mut batch = WriteBatch::new();
                batch.delete(Column::TxByBlock, entry_key.clone());
                detached = false;
                if let Some(bytes) = &current[0] {
                    let mut tx: TransactionRecord = decode(bytes)?;
                    if tx.position.block_hash() == Some(*hash) {
                        tx.position = TxPosition::Pending;
                        batch.put(Column::Transactions, tx_key.clone(), encode(&tx));
                        detached = true;
                    }
                }
                Ok(Some(batch))
            })?;
            if !detached {
                // Confirmed elsewhere; its coins follow that block.
                continue;
            }

            for (coin_key, _) in self.store.scan_prefix(Column::Coins, &keys.coins_of_tx(&txid))? {
                self.modify_coin(&coin_key, |coin| {
                    if matches!(coin.mint_height, MintHeight::Confirmed(_)) {
                        coin.mint_height = MintHeight::Pending;
                        true
                    } else {
                        false
                    }
                })?;
            }
            for (_, spent) in self
                .store
                .scan_prefix(Column::CoinsBySpender, &keys.spender_prefix(&txid))?
            {
                let Some(outpoint) = trailing_outpoint(&spent) else {
                    continue;
                };
                self.modify_coin(&keys.coin(&outpoint), |coin| match coin.spent {
                    SpentState::Confirmed {
                        txid: spender,
                        index,
                        ..
                    } if spender == txid => {
                        coin.spent = SpentState::Pending {
                            txid: spender,
                            index,
                        };
                        true
                    }
                    _ => false,
                })?;
            }
        }
        Ok(entries.len())
    }

    /// Rolls back a block that was written but never processed, the same way
    /// an orphaned block's transactions are unconfirmed. Processed blocks are
    /// left alone.
    pub fn release_unprocessed(&self, key: &ChainKey, hash: &Hash256) -> Result<usize, IndexError> {
        match self.block_by_hash(key, hash)? {
            Some(block) if !block.processed => {
                let released = self.unconfirm_block_transactions(key, hash)?;
                if released > 0 {
                    log_debug!(
                        chain: key,
                        "released {released} transactions of unprocessed block {}",
                        hash256_to_hex(hash)
                    );
                }
                Ok(released)
            }
            _ => Ok(0),
        }
    }

    /// Hashes describing the local chain to a peer: dense for the newest
    /// blocks, then exponentially spaced, ending with the first indexed block.
    pub fn locator(&self, key: &ChainKey) -> Result<Vec<Hash256>, IndexError> {
        let Some(tip) = self.get_local_tip(key)? else {
            return Ok(Vec::new());
        };
        let base = self.base_height(key)?.unwrap_or(0);
        let mut heights = Vec::new();
        let mut height = tip.height;
        let mut step = 1u64;
        loop {
            heights.push(height);
            if height <= base || heights.len() >= MAX_LOCATOR_HASHES - 1 {
                break;
            }
            if heights.len() >= DENSE_LOCATOR_HASHES {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step).max(base);
        }
        if heights.last() != Some(&base) {
            heights.push(base);
        }
        let keys = Keys::new(key);
        let mut out = Vec::with_capacity(heights.len());
        for height in heights {
            if let Some(hash) = canonical_hash(&*self.store, &keys, height)? {
                out.push(hash);
            }
        }
        Ok(out)
    }

    /// Walks the processed chain from the tip down to the first indexed block.
    pub fn check_contiguity(&self, key: &ChainKey) -> Result<ContiguityReport, IndexError> {
        let keys = Keys::new(key);
        let Some(tip) = self.get_local_tip(key)? else {
            return Ok(ContiguityReport {
                base_height: 0,
                tip_height: 0,
                blocks: 0,
            });
        };
        let base = self
            .base_height(key)?
            .ok_or_else(|| IndexError::Contiguity("processed chain has no base".to_string()))?;
        let mut seen = HashSet::new();
        let mut current = tip.clone();
        loop {
            if !seen.insert(current.hash) {
                return Err(IndexError::Contiguity(format!(
                    "cycle at {}",
                    hash256_to_hex(&current.hash)
                )));
            }
            if !current.processed
                || canonical_hash(&*self.store, &keys, current.height)? != Some(current.hash)
            {
                return Err(IndexError::Contiguity(format!(
                    "block {} at height {} is not canonical",
                    hash256_to_hex(&current.hash),
                    current.height
                )));
            }
            if current.height == base {
                break;
            }
            let parent: BlockRecord = self
                .read(Column::Blocks, &keys.block(&current.previous_block_hash))?
                .ok_or_else(|| {
                    IndexError::Contiguity(format!("gap below height {}", current.height))
                })?;
            if parent.height + 1 != current.height || parent.next_block_hash != Some(current.hash) {
                return Err(IndexError::Contiguity(format!(
                    "broken link between heights {} and {}",
                    parent.height, current.height
                )));
            }
            current = parent;
        }
        let slots = self
            .store
            .scan_prefix(Column::CanonicalHeight, keys.prefix())?
            .len() as u64;
        let blocks = seen.len() as u64;
        if slots != blocks {
            return Err(IndexError::Contiguity(format!(
                "{slots} canonical heights but {blocks} linked blocks"
            )));
        }
        Ok(ContiguityReport {
            base_height: base,
            tip_height: tip.height,
            blocks,
        })
    }

    /// Tags `link.address` as belonging to `link.wallet`. Records written
    /// afterwards carry the wallet.
    pub fn add_wallet_address(&self, key: &ChainKey, link: &WalletAddress) -> Result<(), IndexError> {
        let keys = Keys::new(key);
        let mut batch = WriteBatch::new();
        batch.put(
            Column::WalletAddresses,
            keys.wallet_of_address(&link.address, &link.wallet),
            Vec::new(),
        );
        batch.put(
            Column::WalletAddresses,
            keys.address_of_wallet(&link.wallet, &link.address),
            Vec::new(),
        );
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn wallets_for_address(
        &self,
        key: &ChainKey,
        address: &str,
    ) -> Result<Vec<String>, IndexError> {
        let keys = Keys::new(key);
        let prefix = keys.wallets_of_address_prefix(address);
        Ok(self
            .store
            .scan_prefix(Column::WalletAddresses, &prefix)?
            .into_iter()
            .filter_map(|(entry, _)| trailing_label(&entry, prefix.len()))
            .collect())
    }

    pub fn wallet_addresses(&self, key: &ChainKey, wallet: &str) -> Result<Vec<WalletAddress>, IndexError> {
        let keys = Keys::new(key);
        let prefix = keys.addresses_of_wallet_prefix(wallet);
        Ok(self
            .store
            .scan_prefix(Column::WalletAddresses, &prefix)?
            .into_iter()
            .filter_map(|(entry, _)| trailing_label(&entry, prefix.len()))
            .map(|address| WalletAddress {
                wallet: wallet.to_string(),
                address,
            })
            .collect())
    }

    fn wallets_for_addresses(
        &self,
        key: &ChainKey,
        addresses: &[String],
    ) -> Result<Vec<String>, IndexError> {
        let mut wallets = Vec::new();
        for address in addresses {
            merge_labels(&mut wallets, &self.wallets_for_address(key, address)?);
        }
        Ok(wallets)
    }

    /// Coins keyed by outpoint, for callers resolving inputs.
    pub fn coins(
        &self,
        key: &ChainKey,
        outpoints: &[OutPoint],
    ) -> Result<BTreeMap<OutPoint, CoinRecord>, IndexError> {
        let keys = Keys::new(key);
        let mut out = BTreeMap::new();
        for outpoint in outpoints {
            if let Some(coin) = self.read::<CoinRecord>(Column::Coins, &keys.coin(outpoint))? {
                out.insert(*outpoint, coin);
            }
        }
        Ok(out)
    }
}

fn canonical_hash<S: KeyValueStore + ?Sized>(
    store: &S,
    keys: &Keys,
    height: u64,
) -> Result<Option<Hash256>, IndexError> {
    match store.get(Column::CanonicalHeight, &keys.height(height))? {
        Some(bytes) => bytes
            .as_slice()
            .try_into()
            .map(Some)
            .map_err(|_| IndexError::Contiguity("malformed height slot".to_string())),
        None => Ok(None),
    }
}

/// Applies `spend` to a coin's current state. Returns the new state and the
/// transaction that lost a double spend, if any.
fn resolve_spend(current: SpentState, spend: &SpendLink) -> (SpentState, Option<Hash256>) {
    let incoming = spend.state();
    let confirmed = spend.height.is_some();
    match current {
        SpentState::Unspent => (incoming, None),
        SpentState::Confirmed { txid, .. } if txid == spend.spender_txid => {
            if confirmed {
                (incoming, None)
            } else {
                (current, None)
            }
        }
        SpentState::Pending { txid, .. } | SpentState::Conflicting { txid, .. }
            if txid == spend.spender_txid =>
        {
            (incoming, None)
        }
        SpentState::Pending { txid, .. } => {
            if confirmed {
                (incoming, Some(txid))
            } else {
                (current, Some(spend.spender_txid))
            }
        }
        SpentState::Conflicting { .. } => {
            if confirmed {
                (incoming, None)
            } else {
                (current, Some(spend.spender_txid))
            }
        }
        SpentState::Confirmed { .. } => {
            if confirmed {
                (
                    SpentState::Conflicting {
                        txid: spend.spender_txid,
                        index: spend.spender_index,
                    },
                    None,
                )
            } else {
                (current, Some(spend.spender_txid))
            }
        }
    }
}

fn merge_labels(target: &mut Vec<String>, extra: &[String]) {
    for label in extra {
        if !target.contains(label) {
            target.push(label.clone());
        }
    }
    target.sort();
}
