use chainidx_params::{hash256_to_hex, Hash256};
use chainidx_primitives::DecodeError;
use chainidx_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] DecodeError),
    #[error("block {} not found", hash256_to_hex(.0))]
    BlockNotFound(Hash256),
    #[error("parent of block {} is not processed", hash256_to_hex(.0))]
    ParentNotProcessed(Hash256),
    #[error("block {} claims height {height} but its parent is at {parent_height}", hash256_to_hex(.hash))]
    HeightMismatch {
        hash: Hash256,
        height: u64,
        parent_height: u64,
    },
    #[error("height {height} already holds processed block {}", hash256_to_hex(.holder))]
    SlotTaken { height: u64, holder: Hash256 },
    #[error("spend of {} at height {height} precedes its mint at {mint_height}", hash256_to_hex(.txid))]
    SpendBeforeMint {
        txid: Hash256,
        height: u64,
        mint_height: u64,
    },
    #[error("concurrent modification of {0} did not settle")]
    Contention(&'static str),
    #[error("chain is not contiguous: {0}")]
    Contiguity(String),
}
