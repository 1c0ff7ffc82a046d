use chainidx_adapter::{
    adapter_for, BlockContext, ConversionError, NativeBlock, NativeTransaction,
};
use chainidx_index::{MintHeight, TxDetail, TxPosition};
use chainidx_params::{chain_params, ChainFamily, ChainKey, Network};
use chainidx_primitives::{
    block_work, merkle_root, AccountBlock, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut,
};

const REGTEST_BITS: u32 = 0x207f_ffff;

fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase(height: u32, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: p2pkh(1),
        }],
        lock_time: 0,
    }
}

fn block(prev: [u8; 32], time: u32, transactions: Vec<Transaction>) -> Block {
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

fn btc_key() -> ChainKey {
    ChainKey::new("BTC", Network::Regtest)
}

#[test]
fn utxo_blocks_chain_work_and_time() {
    let params = chain_params("BTC", Network::Regtest).expect("params");
    let adapter = adapter_for(&params);
    assert_eq!(adapter.family(), ChainFamily::Utxo);

    let genesis = block([0; 32], 1_000, vec![coinbase(0, 50_0000_0000)]);
    let genesis_ctx = BlockContext {
        key: btc_key(),
        height: 0,
        parent: None,
    };
    let first = adapter
        .convert_block(&NativeBlock::Utxo(genesis.clone()), &genesis_ctx)
        .expect("genesis");
    assert_eq!(first.block.reward, 50_0000_0000);
    assert_eq!(first.block.chainwork(), Some(block_work(REGTEST_BITS)));
    assert_eq!(first.coins.len(), 1);
    assert!(first.coins[0].coinbase);
    assert!(first.spends.is_empty());

    let spend = Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::new(genesis.transactions[0].txid(), 0),
            script_sig: vec![0x51],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![
            TxOut {
                value: 30_0000_0000,
                script_pubkey: p2pkh(2),
            },
            TxOut {
                value: 19_0000_0000,
                script_pubkey: p2pkh(3),
            },
        ],
        lock_time: 0,
    };
    // Timestamp earlier than the parent's: normalized time must still advance.
    let next = block(genesis.hash(), 900, vec![coinbase(1, 51_0000_0000), spend.clone()]);
    let ctx = BlockContext {
        key: btc_key(),
        height: 1,
        parent: Some(first.block.clone()),
    };
    let second = adapter
        .convert_block(&NativeBlock::Utxo(next), &ctx)
        .expect("second block");
    assert_eq!(second.block.time, 900);
    assert_eq!(second.block.time_normalized, 1_001);
    assert_eq!(
        second.block.chainwork(),
        Some(block_work(REGTEST_BITS) + block_work(REGTEST_BITS))
    );
    assert_eq!(second.block.reward, 51_0000_0000);
    assert_eq!(second.transactions.len(), 2);
    assert_eq!(second.transactions[1].index_in_block, 1);
    assert_eq!(second.transactions[1].value, 49_0000_0000);
    assert_eq!(second.transactions[1].fee, None);
    assert_eq!(second.coins.len(), 3);
    assert!(second
        .coins
        .iter()
        .all(|coin| coin.mint_height == MintHeight::Confirmed(1)));
    assert_eq!(second.spends.len(), 1);
    assert_eq!(second.spends[0].spender_txid, spend.txid());
    assert_eq!(second.spends[0].height, Some(1));
    match &second.transactions[1].detail {
        TxDetail::Utxo { inputs, outputs } => {
            assert_eq!(inputs, &vec![OutPoint::new(genesis.transactions[0].txid(), 0)]);
            assert!(outputs.iter().all(|output| output.address.is_some()));
        }
        other => panic!("unexpected detail {other:?}"),
    }
}

#[test]
fn utxo_block_rejects_bad_merkle_root_and_wrong_parent() {
    let params = chain_params("BTC", Network::Regtest).expect("params");
    let adapter = adapter_for(&params);
    let mut bad = block([0; 32], 1_000, vec![coinbase(0, 1)]);
    bad.header.merkle_root = [0xee; 32];
    let ctx = BlockContext {
        key: btc_key(),
        height: 0,
        parent: None,
    };
    let err = adapter
        .convert_block(&NativeBlock::Utxo(bad), &ctx)
        .expect_err("merkle mismatch");
    assert!(matches!(err, ConversionError::Inconsistent(_)));

    let genesis = block([0; 32], 1_000, vec![coinbase(0, 1)]);
    let parent = adapter
        .convert_block(&NativeBlock::Utxo(genesis), &ctx)
        .expect("genesis")
        .block;
    let orphan = block([0x42; 32], 1_100, vec![coinbase(1, 1)]);
    let err = adapter
        .convert_block(
            &NativeBlock::Utxo(orphan),
            &BlockContext {
                key: btc_key(),
                height: 1,
                parent: Some(parent),
            },
        )
        .expect_err("parent mismatch");
    assert!(matches!(err, ConversionError::Inconsistent(_)));
}

fn account_block() -> AccountBlock {
    serde_json::from_value(serde_json::json!({
        "number": "0x2",
        "hash": format!("0x{}", "02".repeat(32)),
        "parentHash": format!("0x{}", "01".repeat(32)),
        "timestamp": "0x64",
        "transactionsRoot": format!("0x{}", "aa".repeat(32)),
        "gasUsed": "0xa410",
        "gasLimit": "0x1c9c380",
        "totalDifficulty": "0x400",
        "size": "0x300",
        "miner": "0x0000000000000000000000000000000000000009",
        "transactions": [
            {
                "hash": format!("0x{}", "10".repeat(32)),
                "from": "0xAA00000000000000000000000000000000000001",
                "to": "0xBB00000000000000000000000000000000000002",
                "value": "0x3e8",
                "gas": "0x5208",
                "gasPrice": "0x2",
                "nonce": "0x0",
                "input": "0x"
            },
            {
                "hash": format!("0x{}", "11".repeat(32)),
                "from": "0xaa00000000000000000000000000000000000001",
                "to": null,
                "value": "0x0",
                "gas": "0x7530",
                "gasPrice": "0x3",
                "nonce": "0x1",
                "input": "0x6000",
                "gasUsed": "0x5208"
            }
        ]
    }))
    .expect("account block json")
}

#[test]
fn account_block_sums_fees_into_reward() {
    let params = chain_params("ETH", Network::Regtest).expect("params");
    let adapter = adapter_for(&params);
    assert_eq!(adapter.family(), ChainFamily::Account);
    let ctx = BlockContext {
        key: params.key.clone(),
        height: 2,
        parent: None,
    };
    let converted = adapter
        .convert_block(&NativeBlock::Account(account_block()), &ctx)
        .expect("account block");
    assert_eq!(converted.block.reward, 21_000 * 2 + 21_000 * 3);
    assert_eq!(converted.block.chainwork(), Some(1024u64.into()));
    assert!(converted.coins.is_empty());
    assert!(converted.spends.is_empty());
    let first = &converted.transactions[0];
    assert_eq!(first.fee, Some(42_000));
    assert_eq!(first.value, 1_000);
    assert_eq!(
        first.position,
        TxPosition::Confirmed {
            block_hash: [0x02; 32],
            block_height: 2
        }
    );
    match &first.detail {
        TxDetail::Account { from, to, .. } => {
            assert_eq!(from, "0xaa00000000000000000000000000000000000001");
            assert_eq!(to.as_deref(), Some("0xbb00000000000000000000000000000000000002"));
        }
        other => panic!("unexpected detail {other:?}"),
    }
    assert_eq!(converted.transactions[1].index_in_block, 1);
}

#[test]
fn account_block_height_must_match_context() {
    let params = chain_params("ETH", Network::Regtest).expect("params");
    let adapter = adapter_for(&params);
    let ctx = BlockContext {
        key: params.key.clone(),
        height: 3,
        parent: None,
    };
    let err = adapter
        .convert_block(&NativeBlock::Account(account_block()), &ctx)
        .expect_err("height mismatch");
    assert!(matches!(err, ConversionError::Inconsistent(_)));
}

#[test]
fn families_do_not_mix() {
    let eth = adapter_for(&chain_params("ETH", Network::Mainnet).expect("eth"));
    let tx = coinbase(0, 1);
    let err = eth
        .convert_tx(&NativeTransaction::Utxo(tx), None)
        .expect_err("family mismatch");
    assert_eq!(
        err,
        ConversionError::FamilyMismatch {
            expected: ChainFamily::Account,
            found: ChainFamily::Utxo,
        }
    );
    assert!(err.to_string().contains("account"));
}
