use chainidx_index::{Amount, BlockRecord, TransactionRecord, TxDetail, TxPosition};
use chainidx_params::{ChainFamily, ChainParams};
use chainidx_primitives::{AccountTransaction, U256};
use rayon::prelude::*;

use crate::{
    check_parent, normalized_time, BlockContext, ChainAdapter, ConversionError, ConvertedBlock,
    ConvertedTx, NativeBlock, NativeTransaction,
};

/// Account-model chains carry no coins; balances replay transaction values.
#[derive(Default)]
pub struct AccountAdapter;

impl AccountAdapter {
    pub fn new(_params: &ChainParams) -> Self {
        Self
    }

    fn convert(
        &self,
        tx: &AccountTransaction,
        index_in_block: u32,
        block: Option<&BlockRecord>,
    ) -> Result<TransactionRecord, ConversionError> {
        let fee = tx
            .fee()
            .ok_or(ConversionError::ValueOutOfRange("fee"))
            .and_then(|fee| to_amount(fee, "fee"))?;
        let position = match block {
            Some(block) => TxPosition::Confirmed {
                block_hash: block.hash,
                block_height: block.height,
            },
            None => TxPosition::Pending,
        };
        Ok(TransactionRecord {
            txid: tx.hash,
            position,
            index_in_block,
            block_time: block.map(|b| b.time).unwrap_or_default(),
            block_time_normalized: block.map(|b| b.time_normalized).unwrap_or_default(),
            coinbase: false,
            fee: Some(fee),
            value: to_amount(tx.value, "value")?,
            size: u32::try_from(tx.serialized_size())
                .map_err(|_| ConversionError::ValueOutOfRange("size"))?,
            locktime: 0,
            detail: TxDetail::Account {
                from: normalize_address(&tx.from)?,
                to: tx.to.as_deref().map(normalize_address).transpose()?,
                nonce: tx.nonce,
                gas_limit: tx.gas,
                gas_price: to_amount(tx.gas_price, "gas price")?,
            },
            wallets: Vec::new(),
        })
    }
}

fn to_amount(value: U256, what: &'static str) -> Result<Amount, ConversionError> {
    if value.bits() > 128 {
        return Err(ConversionError::ValueOutOfRange(what));
    }
    Ok(value.low_u128())
}

fn normalize_address(raw: &str) -> Result<String, ConversionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConversionError::MissingField("from"));
    }
    Ok(trimmed.to_ascii_lowercase())
}

impl ChainAdapter for AccountAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Account
    }

    fn convert_block(
        &self,
        native: &NativeBlock,
        ctx: &BlockContext,
    ) -> Result<ConvertedBlock, ConversionError> {
        let NativeBlock::Account(block) = native else {
            return Err(ConversionError::FamilyMismatch {
                expected: ChainFamily::Account,
                found: native.family(),
            });
        };
        if block.number != ctx.height {
            return Err(ConversionError::Inconsistent(format!(
                "block number {} delivered for height {}",
                block.number, ctx.height
            )));
        }
        let parent = ctx.parent.as_ref();
        check_parent(&block.parent_hash, ctx.height, parent)?;

        let mut record = BlockRecord {
            hash: block.hash,
            height: block.number,
            version: 0,
            previous_block_hash: block.parent_hash,
            next_block_hash: None,
            time: block.timestamp,
            time_normalized: normalized_time(block.timestamp, parent),
            merkle_root: block.transactions_root,
            bits: 0,
            nonce: block.nonce,
            transaction_count: u32::try_from(block.transactions.len())
                .map_err(|_| ConversionError::ValueOutOfRange("transaction count"))?,
            size: block.size,
            reward: 0,
            chainwork: block.total_difficulty.map(|td| td.to_big_endian()),
            processed: false,
        };

        let transactions = block
            .transactions
            .par_iter()
            .enumerate()
            .map(|(index, tx)| self.convert(tx, index as u32, Some(&record)))
            .collect::<Result<Vec<_>, _>>()?;
        record.reward = transactions.iter().try_fold(0u128, |acc, tx| {
            acc.checked_add(tx.fee.unwrap_or_default())
                .ok_or(ConversionError::ValueOutOfRange("block reward"))
        })?;

        Ok(ConvertedBlock {
            block: record,
            transactions,
            coins: Vec::new(),
            spends: Vec::new(),
        })
    }

    fn convert_tx(
        &self,
        native: &NativeTransaction,
        block: Option<&BlockRecord>,
    ) -> Result<ConvertedTx, ConversionError> {
        match native {
            NativeTransaction::Account(tx) => Ok(ConvertedTx {
                transaction: Some(self.convert(tx, 0, block)?),
                coins: Vec::new(),
                spends: Vec::new(),
            }),
            NativeTransaction::Utxo(_) => Err(ConversionError::FamilyMismatch {
                expected: ChainFamily::Account,
                found: ChainFamily::Utxo,
            }),
        }
    }
}
