use chainidx_index::{
    Amount, BlockRecord, CoinRecord, MintHeight, SpendLink, SpentState, TransactionRecord,
    TxDetail, TxOutputSummary, TxPosition,
};
use chainidx_params::{AddressPrefixes, ChainFamily, ChainParams};
use chainidx_primitives::work::{work_from_bytes, work_to_bytes};
use chainidx_primitives::{block_work, script_to_address, Transaction};
use rayon::prelude::*;

use crate::{
    check_parent, normalized_time, BlockContext, ChainAdapter, ConversionError, ConvertedBlock,
    ConvertedTx, NativeBlock, NativeTransaction,
};

pub struct UtxoAdapter {
    prefixes: AddressPrefixes,
}

impl UtxoAdapter {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            prefixes: params.address,
        }
    }

    fn convert(
        &self,
        tx: &Transaction,
        index_in_block: u32,
        block: Option<&BlockRecord>,
    ) -> Result<ConvertedTx, ConversionError> {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();
        let (position, mint_height, spend_height) = match block {
            Some(block) => (
                TxPosition::Confirmed {
                    block_hash: block.hash,
                    block_height: block.height,
                },
                MintHeight::Confirmed(block.height),
                Some(block.height),
            ),
            None => (TxPosition::Pending, MintHeight::Pending, None),
        };

        let mut outputs = Vec::with_capacity(tx.vout.len());
        let mut coins = Vec::with_capacity(tx.vout.len());
        let mut value: Amount = 0;
        for (index, output) in tx.vout.iter().enumerate() {
            let amount = output_amount(output.value)?;
            value = value
                .checked_add(amount)
                .ok_or(ConversionError::ValueOutOfRange("output sum"))?;
            let address = script_to_address(&output.script_pubkey, &self.prefixes);
            outputs.push(TxOutputSummary {
                value: amount,
                address: address.clone(),
            });
            coins.push(CoinRecord {
                outpoint: chainidx_primitives::OutPoint::new(txid, index as u32),
                mint_height,
                coinbase,
                value: amount,
                address,
                script: output.script_pubkey.clone(),
                spent: SpentState::Unspent,
                wallets: Vec::new(),
            });
        }

        let (inputs, spends) = if coinbase {
            (Vec::new(), Vec::new())
        } else {
            let inputs: Vec<_> = tx.vin.iter().map(|input| input.prevout).collect();
            let spends = inputs
                .iter()
                .enumerate()
                .map(|(index, outpoint)| SpendLink {
                    outpoint: *outpoint,
                    spender_txid: txid,
                    spender_index: index as u32,
                    height: spend_height,
                })
                .collect();
            (inputs, spends)
        };

        let transaction = TransactionRecord {
            txid,
            position,
            index_in_block,
            block_time: block.map(|b| b.time).unwrap_or_default(),
            block_time_normalized: block.map(|b| b.time_normalized).unwrap_or_default(),
            coinbase,
            // Non-coinbase fees need the input coins; the index derives them.
            fee: coinbase.then_some(0),
            value,
            size: u32::try_from(tx.size()).map_err(|_| ConversionError::ValueOutOfRange("size"))?,
            locktime: tx.lock_time,
            detail: TxDetail::Utxo { inputs, outputs },
            wallets: Vec::new(),
        };
        Ok(ConvertedTx {
            transaction: Some(transaction),
            coins,
            spends,
        })
    }
}

fn output_amount(value: i64) -> Result<Amount, ConversionError> {
    u128::try_from(value).map_err(|_| ConversionError::ValueOutOfRange("output value"))
}

impl ChainAdapter for UtxoAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Utxo
    }

    fn convert_block(
        &self,
        native: &NativeBlock,
        ctx: &BlockContext,
    ) -> Result<ConvertedBlock, ConversionError> {
        let NativeBlock::Utxo(block) = native else {
            return Err(ConversionError::FamilyMismatch {
                expected: ChainFamily::Utxo,
                found: native.family(),
            });
        };
        let parent = ctx.parent.as_ref();
        check_parent(&block.header.prev_block, ctx.height, parent)?;

        let Some(first) = block.transactions.first() else {
            return Err(ConversionError::Inconsistent("block has no transactions".to_string()));
        };
        if !first.is_coinbase() {
            return Err(ConversionError::Inconsistent(
                "first transaction is not a coinbase".to_string(),
            ));
        }
        if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(ConversionError::Inconsistent(
                "coinbase past the first position".to_string(),
            ));
        }
        if block.compute_merkle_root() != Some(block.header.merkle_root) {
            return Err(ConversionError::Inconsistent("merkle root mismatch".to_string()));
        }

        let reward = first.vout.iter().try_fold(0u128, |acc, output| {
            acc.checked_add(output_amount(output.value)?)
                .ok_or(ConversionError::ValueOutOfRange("block reward"))
        })?;
        let time = u64::from(block.header.time);
        // Cumulative work is only known when the parent's is.
        let chainwork = parent
            .and_then(|p| p.chainwork.as_ref())
            .map(|bytes| work_from_bytes(bytes).saturating_add(block_work(block.header.bits)))
            .map(work_to_bytes)
            .or_else(|| parent.is_none().then(|| work_to_bytes(block_work(block.header.bits))));

        let record = BlockRecord {
            hash: block.hash(),
            height: ctx.height,
            version: block.header.version as u32,
            previous_block_hash: block.header.prev_block,
            next_block_hash: None,
            time,
            time_normalized: normalized_time(time, parent),
            merkle_root: block.header.merkle_root,
            bits: block.header.bits,
            nonce: u64::from(block.header.nonce),
            transaction_count: u32::try_from(block.transactions.len())
                .map_err(|_| ConversionError::ValueOutOfRange("transaction count"))?,
            size: block.size() as u64,
            reward,
            chainwork,
            processed: false,
        };

        let converted = block
            .transactions
            .par_iter()
            .enumerate()
            .map(|(index, tx)| self.convert(tx, index as u32, Some(&record)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut transactions = Vec::with_capacity(converted.len());
        let mut coins = Vec::new();
        let mut spends = Vec::new();
        for tx in converted {
            transactions.extend(tx.transaction);
            coins.extend(tx.coins);
            spends.extend(tx.spends);
        }
        Ok(ConvertedBlock {
            block: record,
            transactions,
            coins,
            spends,
        })
    }

    fn convert_tx(
        &self,
        native: &NativeTransaction,
        block: Option<&BlockRecord>,
    ) -> Result<ConvertedTx, ConversionError> {
        match native {
            NativeTransaction::Utxo(tx) => self.convert(tx, 0, block),
            NativeTransaction::Account(_) => Err(ConversionError::FamilyMismatch {
                expected: ChainFamily::Utxo,
                found: ChainFamily::Account,
            }),
        }
    }
}
