//! Conversion of chain-native blocks and transactions into canonical records.

mod account;
mod utxo;

use std::sync::Arc;

use chainidx_index::{BlockRecord, CoinRecord, SpendLink, TransactionRecord};
use chainidx_params::{ChainFamily, ChainKey, ChainParams};
use chainidx_primitives::{AccountBlock, AccountTransaction, Block, Transaction};

pub use account::AccountAdapter;
pub use utxo::UtxoAdapter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeBlock {
    Utxo(Block),
    Account(AccountBlock),
}

impl NativeBlock {
    pub fn family(&self) -> ChainFamily {
        match self {
            NativeBlock::Utxo(_) => ChainFamily::Utxo,
            NativeBlock::Account(_) => ChainFamily::Account,
        }
    }

    pub fn hash(&self) -> chainidx_params::Hash256 {
        match self {
            NativeBlock::Utxo(block) => block.hash(),
            NativeBlock::Account(block) => block.hash,
        }
    }

    pub fn previous_hash(&self) -> chainidx_params::Hash256 {
        match self {
            NativeBlock::Utxo(block) => block.header.prev_block,
            NativeBlock::Account(block) => block.parent_hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeTransaction {
    Utxo(Transaction),
    Account(AccountTransaction),
}

/// What the adapter needs to know about where a block lands.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub key: ChainKey,
    pub height: u64,
    /// Local record of the parent, when indexed.
    pub parent: Option<BlockRecord>,
}

#[derive(Clone, Debug, Default)]
pub struct ConvertedTx {
    pub transaction: Option<TransactionRecord>,
    pub coins: Vec<CoinRecord>,
    pub spends: Vec<SpendLink>,
}

#[derive(Clone, Debug)]
pub struct ConvertedBlock {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
    pub coins: Vec<CoinRecord>,
    pub spends: Vec<SpendLink>,
}

/// Permanent for the object that produced it; the block is never marked processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("expected a {} object, got {}", .expected.as_str(), .found.as_str())]
    FamilyMismatch {
        expected: ChainFamily,
        found: ChainFamily,
    },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("{0} out of range")]
    ValueOutOfRange(&'static str),
    #[error("inconsistent block: {0}")]
    Inconsistent(String),
}

pub trait ChainAdapter: Send + Sync {
    fn family(&self) -> ChainFamily;

    fn convert_block(
        &self,
        native: &NativeBlock,
        ctx: &BlockContext,
    ) -> Result<ConvertedBlock, ConversionError>;

    /// `block` is the containing block, or `None` for an unconfirmed transaction.
    fn convert_tx(
        &self,
        native: &NativeTransaction,
        block: Option<&BlockRecord>,
    ) -> Result<ConvertedTx, ConversionError>;
}

pub fn adapter_for(params: &ChainParams) -> Arc<dyn ChainAdapter> {
    match params.family {
        ChainFamily::Utxo => Arc::new(UtxoAdapter::new(params)),
        ChainFamily::Account => Arc::new(AccountAdapter::new(params)),
    }
}

/// `max(time, parent.time_normalized + 1)`.
pub(crate) fn normalized_time(time: u64, parent: Option<&BlockRecord>) -> u64 {
    match parent {
        Some(parent) => time.max(parent.time_normalized.saturating_add(1)),
        None => time,
    }
}

pub(crate) fn check_parent(
    previous: &chainidx_params::Hash256,
    height: u64,
    parent: Option<&BlockRecord>,
) -> Result<(), ConversionError> {
    let Some(parent) = parent else {
        return Ok(());
    };
    if parent.hash != *previous {
        return Err(ConversionError::Inconsistent(
            "previous hash does not match parent".to_string(),
        ));
    }
    if parent.height.saturating_add(1) != height {
        return Err(ConversionError::Inconsistent(format!(
            "height {height} does not follow parent height {}",
            parent.height
        )));
    }
    Ok(())
}
