use std::sync::Arc;

use chainidx_index::{
    BlockRecord, CoinRecord, IndexError, IndexStore, MintHeight, SpendLink, SpentState,
    TransactionRecord, TxDetail, TxOutputSummary, TxPosition,
};
use chainidx_params::{ChainFamily, ChainKey, Hash256, Network};
use chainidx_primitives::OutPoint;
use chainidx_storage::memory::MemoryStore;

type Index = IndexStore<MemoryStore>;

fn key() -> ChainKey {
    ChainKey::new("LTC", Network::Regtest)
}

fn hash(tag: u8, n: u64) -> Hash256 {
    let mut out = [tag; 32];
    out[..8].copy_from_slice(&n.to_le_bytes());
    out
}

fn block(branch: u8, height: u64, prev: Hash256) -> BlockRecord {
    BlockRecord {
        hash: hash(branch, height),
        height,
        version: 1,
        previous_block_hash: prev,
        next_block_hash: None,
        time: 5_000 + height * 10,
        time_normalized: 5_000 + height * 10,
        merkle_root: [0u8; 32],
        bits: 0x207f_ffff,
        nonce: 0,
        transaction_count: 1,
        size: 250,
        reward: 25,
        chainwork: None,
        processed: false,
    }
}

fn payment(txid: Hash256, at: Option<&BlockRecord>, spends: &[OutPoint], value: u128) -> TransactionRecord {
    TransactionRecord {
        txid,
        position: match at {
            Some(block) => TxPosition::Confirmed {
                block_hash: block.hash,
                block_height: block.height,
            },
            None => TxPosition::Pending,
        },
        index_in_block: 1,
        block_time: at.map(|block| block.time).unwrap_or(0),
        block_time_normalized: at.map(|block| block.time_normalized).unwrap_or(0),
        coinbase: spends.is_empty(),
        fee: None,
        value,
        size: 120,
        locktime: 0,
        detail: TxDetail::Utxo {
            inputs: spends.to_vec(),
            outputs: vec![TxOutputSummary {
                value,
                address: Some("payee".to_string()),
            }],
        },
        wallets: Vec::new(),
    }
}

fn coin(txid: Hash256, height: MintHeight, value: u128) -> CoinRecord {
    CoinRecord {
        outpoint: OutPoint::new(txid, 0),
        mint_height: height,
        coinbase: false,
        value,
        address: Some("payee".to_string()),
        script: vec![0x00, 0x14],
        spent: SpentState::Unspent,
        wallets: Vec::new(),
    }
}

fn process(index: &Index, key: &ChainKey, block: &BlockRecord, txs: &[TransactionRecord]) {
    index.upsert_block(key, block).expect("block");
    index.upsert_transactions(key, txs).expect("txs");
    for tx in txs {
        let height = MintHeight::Confirmed(block.height);
        index.upsert_coins(key, &[coin(tx.txid, height, tx.value)]).expect("coins");
        if let TxDetail::Utxo { inputs, .. } = &tx.detail {
            let spends: Vec<SpendLink> = inputs
                .iter()
                .enumerate()
                .map(|(index, outpoint)| SpendLink {
                    outpoint: *outpoint,
                    spender_txid: tx.txid,
                    spender_index: index as u32,
                    height: Some(block.height),
                })
                .collect();
            index.apply_spends(key, &spends).expect("spends");
        }
    }
    index.mark_processed(key, &block.hash).expect("processed");
}

/// Heights 0..=12 on branch A; the funding coin lands at height 5.
fn branch_a(index: &Index, key: &ChainKey) -> Vec<BlockRecord> {
    let mut blocks: Vec<BlockRecord> = Vec::new();
    let mut prev = [0u8; 32];
    for height in 0..=12 {
        let record = block(0xa0, height, prev);
        let mut txs = Vec::new();
        if height == 5 {
            txs.push(payment(hash(0xf0, 0), Some(&record), &[], 1_000));
        }
        if height == 10 {
            // Shared by both branches.
            txs.push(payment(hash(0x5a, 0), Some(&record), &[OutPoint::new(hash(0xf0, 0), 0)], 900));
        }
        if height == 11 {
            txs.push(payment(hash(0xa1, 0), Some(&record), &[], 77));
        }
        process(index, key, &record, &txs);
        prev = record.hash;
        blocks.push(record);
    }
    blocks
}

fn reorg_to_b(index: &Index, key: &ChainKey, a: &[BlockRecord]) -> Vec<BlockRecord> {
    for orphan in a[10..=12].iter().rev() {
        index.mark_orphaned(key, &orphan.hash).expect("orphan");
        index
            .unconfirm_block_transactions(key, &orphan.hash)
            .expect("unconfirm");
    }
    let mut prev = a[9].hash;
    let mut b = Vec::new();
    for height in 10..=13 {
        let record = block(0xb0, height, prev);
        let mut txs = Vec::new();
        if height == 12 {
            txs.push(payment(hash(0x5a, 0), Some(&record), &[OutPoint::new(hash(0xf0, 0), 0)], 900));
        }
        process(index, key, &record, &txs);
        prev = record.hash;
        b.push(record);
    }
    b
}

#[test]
fn reorg_switches_branches_and_detaches_old_transactions() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let a = branch_a(&index, &key);
    let b = reorg_to_b(&index, &key, &a);

    for old in &a[10..=12] {
        let record = index.block_by_hash(&key, &old.hash).expect("read").expect("kept");
        assert!(!record.processed, "A{} still processed", old.height);
    }
    for new in &b {
        let record = index.block_by_hash(&key, &new.hash).expect("read").expect("row");
        assert!(record.processed, "B{} not processed", new.height);
    }
    let tip = index.get_local_tip(&key).expect("tip").expect("some");
    assert_eq!(tip.hash, b[3].hash);
    assert_eq!(index.check_contiguity(&key).expect("contiguous").blocks, 14);
    assert_eq!(
        index
            .block_by_hash(&key, &a[9].hash)
            .expect("read")
            .expect("ancestor")
            .next_block_hash,
        Some(b[0].hash)
    );

    let a_only = index.transaction(&key, &hash(0xa1, 0)).expect("read").expect("kept");
    assert_eq!(a_only.position, TxPosition::Pending);
    let a_only_coin = index
        .coins(&key, &[OutPoint::new(hash(0xa1, 0), 0)])
        .expect("coins");
    assert_eq!(
        a_only_coin.values().next().map(|coin| coin.mint_height),
        Some(MintHeight::Pending)
    );

    let shared = index.transaction(&key, &hash(0x5a, 0)).expect("read").expect("shared");
    assert_eq!(shared.position.block_hash(), Some(b[2].hash));
    let funding = index
        .coins(&key, &[OutPoint::new(hash(0xf0, 0), 0)])
        .expect("coins");
    assert!(matches!(
        funding.values().next().map(|coin| coin.spent),
        Some(SpentState::Confirmed { height: 12, .. })
    ));
}

#[test]
fn reorg_is_idempotent_when_replayed() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let a = branch_a(&index, &key);
    let b = reorg_to_b(&index, &key, &a);
    for record in &b {
        index.upsert_block(&key, record).expect("upsert");
        index.mark_processed(&key, &record.hash).expect("again");
    }
    assert_eq!(index.check_contiguity(&key).expect("contiguous").tip_height, 13);
}

#[test]
fn spend_fee_is_derived_from_input_coins() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    branch_a(&index, &key);
    let spender = index.transaction(&key, &hash(0x5a, 0)).expect("read").expect("tx");
    assert_eq!(spender.fee, Some(100));

    let balance = index
        .balance_for_address(&key, ChainFamily::Utxo, "payee")
        .expect("balance");
    // 1000 minted and spent; 900 + 77 remain.
    assert_eq!(balance.confirmed, 977);
}

#[test]
fn spend_below_mint_height_is_rejected() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    branch_a(&index, &key);
    let early = SpendLink {
        outpoint: OutPoint::new(hash(0xa1, 0), 0),
        spender_txid: hash(0xee, 0),
        spender_index: 0,
        height: Some(3),
    };
    let err = index.apply_spends(&key, &[early]).expect_err("spend before mint");
    assert!(matches!(err, IndexError::SpendBeforeMint { mint_height: 11, .. }));
}

#[test]
fn spend_seen_before_its_coin_is_applied_later() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let outpoint = OutPoint::new(hash(0x77, 0), 0);
    let spend = SpendLink {
        outpoint,
        spender_txid: hash(0x78, 0),
        spender_index: 0,
        height: Some(40),
    };
    index.apply_spends(&key, &[spend]).expect("park");
    index
        .upsert_coins(&key, &[coin(hash(0x77, 0), MintHeight::Confirmed(30), 5)])
        .expect("coin");
    let stored = index.coins(&key, &[outpoint]).expect("coins");
    assert_eq!(
        stored.get(&outpoint).map(|coin| coin.spent),
        Some(spend.state())
    );
}

#[test]
fn double_spend_marks_loser_conflicting() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let a = branch_a(&index, &key);
    let funding = OutPoint::new(hash(0xa1, 0), 0);

    let mempool = payment(hash(0xd1, 0), None, &[funding], 70);
    index.upsert_transactions(&key, &[mempool.clone()]).expect("mempool tx");
    index
        .apply_spends(
            &key,
            &[SpendLink {
                outpoint: funding,
                spender_txid: mempool.txid,
                spender_index: 0,
                height: None,
            }],
        )
        .expect("pending spend");

    let next = block(0xa0, 13, a[12].hash);
    let winner = payment(hash(0xd2, 0), Some(&next), &[funding], 60);
    process(&index, &key, &next, &[winner]);

    let loser = index.transaction(&key, &mempool.txid).expect("read").expect("loser");
    assert_eq!(loser.position, TxPosition::Conflicting);
    let coin = index.coins(&key, &[funding]).expect("coins");
    assert!(matches!(
        coin.get(&funding).map(|coin| coin.spent),
        Some(SpentState::Confirmed { height: 13, .. })
    ));
}

#[test]
fn spends_from_an_unprocessed_block_do_not_touch_balances() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let a = branch_a(&index, &key);
    let before = index
        .balance_for_address(&key, ChainFamily::Utxo, "payee")
        .expect("balance");
    assert_eq!(before.confirmed, 977);

    // Height 13 on a parent this index never processed.
    let stale = block(0xcc, 13, hash(0xcc, 12));
    let funding = OutPoint::new(hash(0xa1, 0), 0);
    let stale_spend = payment(hash(0xc1, 0), Some(&stale), &[funding], 70);
    index.upsert_block(&key, &stale).expect("block");
    index.upsert_transactions(&key, &[stale_spend.clone()]).expect("txs");
    index
        .upsert_coins(&key, &[coin(stale_spend.txid, MintHeight::Confirmed(13), 70)])
        .expect("coins");
    index
        .apply_spends(
            &key,
            &[SpendLink {
                outpoint: funding,
                spender_txid: stale_spend.txid,
                spender_index: 0,
                height: Some(13),
            }],
        )
        .expect("spends");
    let err = index.mark_processed(&key, &stale.hash).expect_err("parent unknown");
    assert!(matches!(err, IndexError::ParentNotProcessed(_)));
    assert_eq!(
        index
            .balance_for_address(&key, ChainFamily::Utxo, "payee")
            .expect("balance"),
        before
    );

    assert_eq!(index.release_unprocessed(&key, &stale.hash).expect("release"), 1);
    let released = index.transaction(&key, &stale_spend.txid).expect("read").expect("kept");
    assert_eq!(released.position, TxPosition::Pending);
    assert_eq!(
        index
            .balance_for_address(&key, ChainFamily::Utxo, "payee")
            .expect("balance")
            .confirmed,
        977
    );

    let next = block(0xa0, 13, a[12].hash);
    let winner = payment(hash(0xd2, 0), Some(&next), &[funding], 60);
    process(&index, &key, &next, &[winner]);
    let after = index
        .balance_for_address(&key, ChainFamily::Utxo, "payee")
        .expect("balance");
    assert_eq!(after.confirmed, 977 - 77 + 60);
    assert_eq!(after.unconfirmed, 0);
    let loser = index.transaction(&key, &stale_spend.txid).expect("read").expect("loser");
    assert_eq!(loser.position, TxPosition::Conflicting);
}

#[test]
fn releasing_a_processed_block_is_a_no_op() {
    let index = IndexStore::new(Arc::new(MemoryStore::new()));
    let key = key();
    let a = branch_a(&index, &key);
    assert_eq!(index.release_unprocessed(&key, &a[11].hash).expect("release"), 0);
    let kept = index.transaction(&key, &hash(0xa1, 0)).expect("read").expect("tx");
    assert!(kept.position.is_confirmed());
}
