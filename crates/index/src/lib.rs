//! The Storage Layer: canonical block, transaction and coin records for every
//! indexed (chain, network), with idempotent upserts and reorg bookkeeping.

mod balance;
mod error;
mod keys;
mod query;
pub mod records;
mod store;

pub use balance::Balance;
pub use error::IndexError;
pub use query::{TxCoins, TxFilter};
pub use records::{
    Amount, BlockRecord, CacheEntry, CoinRecord, MintHeight, SpendLink, SpentState, TxDetail,
    TxOutputSummary, TxPosition, TransactionRecord, WalletAddress,
};
pub use store::{ContiguityReport, IndexStore, UpsertOutcome, MAX_LOCATOR_HASHES};
