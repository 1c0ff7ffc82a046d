#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainidx::source::{Announcement, ChainSource, HeaderSummary, SourceError};
use chainidx_adapter::{BlockContext, ChainAdapter, NativeBlock};
use chainidx_index::{BlockRecord, IndexStore};
use chainidx_params::{ChainKey, Hash256};
use chainidx_primitives::{
    merkle_root, AccountBlock, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut,
};
use chainidx_storage::memory::MemoryStore;
use chainidx_storage::KeyValueStore;

pub const REGTEST_BITS: u32 = 0x207f_ffff;

pub fn memory_index() -> IndexStore<dyn KeyValueStore> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    IndexStore::new(store)
}

pub fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Coinbase unique to `(branch, height)`.
pub fn coinbase(branch: u8, height: u32) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(branch);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: p2pkh(branch),
        }],
        lock_time: 0,
    }
}

pub fn payment(from: OutPoint, value: i64, to: u8) -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: from,
            script_sig: vec![0x51],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: p2pkh(to),
        }],
        lock_time: 0,
    }
}

pub fn utxo_block(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let root = merkle_root(transactions.iter().map(Transaction::txid).collect())
        .expect("non-empty block");
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: root,
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    }
}

/// Blocks `from..=to` on `branch`, each with its own coinbase plus `extra(height)`.
pub fn utxo_chain(
    prev: Hash256,
    branch: u8,
    from: u32,
    to: u32,
    mut extra: impl FnMut(u32) -> Vec<Transaction>,
) -> Vec<Block> {
    let mut out = Vec::new();
    let mut prev = prev;
    for height in from..=to {
        let mut txs = vec![coinbase(branch, height)];
        txs.extend(extra(height));
        let block = utxo_block(prev, 1_600_000_000 + height * 600, txs);
        prev = block.hash();
        out.push(block);
    }
    out
}

pub fn account_hash(branch: u8, number: u64) -> Hash256 {
    let mut hash = [branch; 32];
    hash[24..].copy_from_slice(&number.to_be_bytes());
    hash
}

pub fn account_block(branch: u8, number: u64, parent: Hash256) -> AccountBlock {
    serde_json::from_value(serde_json::json!({
        "number": format!("0x{number:x}"),
        "hash": format!("0x{}", hex::encode(account_hash(branch, number))),
        "parentHash": format!("0x{}", hex::encode(parent)),
        "timestamp": format!("0x{:x}", 1_700_000_000 + number * 12),
        "transactionsRoot": format!("0x{}", "00".repeat(32)),
        "gasUsed": "0x5208",
        "gasLimit": "0x1c9c380",
        "size": "0x220",
        "miner": "0x0000000000000000000000000000000000000009",
        "transactions": [{
            "hash": format!("0x{}", hex::encode(account_hash(branch ^ 0xff, number))),
            "from": "0xaa00000000000000000000000000000000000001",
            "to": "0xbb00000000000000000000000000000000000002",
            "value": "0x3e8",
            "gas": "0x5208",
            "gasPrice": format!("0x{:x}", 1_000_000_000 + number),
            "nonce": format!("0x{number:x}"),
            "input": "0x"
        }]
    }))
    .expect("account block json")
}

/// Converts and stores `native` as processed on top of `parent`.
pub fn seed(
    index: &IndexStore<dyn KeyValueStore>,
    adapter: &Arc<dyn ChainAdapter>,
    key: &ChainKey,
    native: &NativeBlock,
    height: u64,
    parent: Option<BlockRecord>,
) -> BlockRecord {
    let ctx = BlockContext {
        key: key.clone(),
        height,
        parent,
    };
    let converted = adapter.convert_block(native, &ctx).expect("convert");
    index.upsert_block(key, &converted.block).expect("block");
    index
        .upsert_transactions(key, &converted.transactions)
        .expect("transactions");
    index.upsert_coins(key, &converted.coins).expect("coins");
    index.apply_spends(key, &converted.spends).expect("spends");
    index.mark_processed(key, &converted.block.hash).expect("processed");
    index
        .block_by_hash(key, &converted.block.hash)
        .expect("read")
        .expect("stored")
}

/// A source serving a swappable best chain of UTXO or account blocks.
pub struct FakeSource {
    chain: Mutex<Vec<NativeBlock>>,
    known: Mutex<HashMap<Hash256, NativeBlock>>,
    base_height: u64,
    announcements: Mutex<VecDeque<Announcement>>,
    pub suspects: Mutex<Vec<String>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl FakeSource {
    pub fn new(base_height: u64, chain: Vec<NativeBlock>) -> Arc<Self> {
        let source = Arc::new(Self {
            chain: Mutex::new(Vec::new()),
            known: Mutex::new(HashMap::new()),
            base_height,
            announcements: Mutex::new(VecDeque::new()),
            suspects: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        });
        source.set_chain(chain);
        source
    }

    pub fn set_chain(&self, chain: Vec<NativeBlock>) {
        let mut known = self.known.lock().expect("known");
        for block in &chain {
            known.insert(block.hash(), block.clone());
        }
        *self.chain.lock().expect("chain") = chain;
    }

    pub fn announce(&self, announcement: Announcement) {
        self.announcements
            .lock()
            .expect("announcements")
            .push_back(announcement);
    }

    fn summary(block: &NativeBlock) -> HeaderSummary {
        match block {
            NativeBlock::Utxo(block) => HeaderSummary::from_header(&block.header),
            NativeBlock::Account(block) => HeaderSummary {
                hash: block.hash,
                previous_hash: block.parent_hash,
                work: None,
            },
        }
    }
}

#[async_trait]
impl ChainSource for FakeSource {
    async fn remote_tip(&self) -> Result<u64, SourceError> {
        let len = self.chain.lock().expect("chain").len() as u64;
        if len == 0 {
            return Err(SourceError::NoPeers);
        }
        Ok(self.base_height + len - 1)
    }

    async fn headers_after(&self, locator: &[Hash256]) -> Result<Vec<HeaderSummary>, SourceError> {
        let chain = self.chain.lock().expect("chain");
        let start = locator
            .iter()
            .find_map(|hash| chain.iter().position(|block| block.hash() == *hash))
            .map_or(0, |position| position + 1);
        Ok(chain[start..].iter().map(Self::summary).collect())
    }

    async fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<NativeBlock>, SourceError> {
        let known = self.known.lock().expect("known");
        hashes
            .iter()
            .map(|hash| known.get(hash).cloned().ok_or(SourceError::NotFound(*hash)))
            .collect()
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<NativeBlock>, SourceError> {
        let chain = self.chain.lock().expect("chain");
        let from = start.checked_sub(self.base_height).ok_or(SourceError::Unsupported("range"))?;
        let to = end - self.base_height;
        Ok(chain[from as usize..=to as usize].to_vec())
    }

    async fn next_announcement(&self, wait: Duration) -> Result<Option<Announcement>, SourceError> {
        let queued = self.announcements.lock().expect("announcements").pop_front();
        if queued.is_none() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(queued)
    }

    async fn report_suspect(&self, reason: &str) {
        self.suspects.lock().expect("suspects").push(reason.to_string());
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<Hash256, SourceError> {
        self.broadcasts.lock().expect("broadcasts").push(raw.to_vec());
        Ok(chainidx_primitives::sha256d(raw))
    }
}
