//! Column-oriented key-value storage with atomic batches and conditional commits.

use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Blocks,
    CanonicalHeight,
    Transactions,
    TxByBlock,
    TxByAddress,
    TxByWallet,
    Coins,
    CoinsByAddress,
    CoinsByWallet,
    CoinsBySpender,
    WalletAddresses,
    Cache,
    Meta,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::Blocks,
        Column::CanonicalHeight,
        Column::Transactions,
        Column::TxByBlock,
        Column::TxByAddress,
        Column::TxByWallet,
        Column::Coins,
        Column::CoinsByAddress,
        Column::CoinsByWallet,
        Column::CoinsBySpender,
        Column::WalletAddresses,
        Column::Cache,
        Column::Meta,
    ];

    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Blocks => "blocks",
            Column::CanonicalHeight => "canonical_height",
            Column::Transactions => "transactions",
            Column::TxByBlock => "tx_by_block",
            Column::TxByAddress => "tx_by_address",
            Column::TxByWallet => "tx_by_wallet",
            Column::Coins => "coins",
            Column::CoinsByAddress => "coins_by_address",
            Column::CoinsByWallet => "coins_by_wallet",
            Column::CoinsBySpender => "coins_by_spender",
            Column::WalletAddresses => "wallet_addresses",
            Column::Cache => "cache",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 80]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 32]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Expected current value of one key; `None` means the key must be absent.
#[derive(Clone, Debug)]
pub struct Precondition {
    pub column: Column,
    pub key: Vec<u8>,
    pub expected: Option<Vec<u8>>,
}

impl Precondition {
    pub fn new(column: Column, key: impl Into<Vec<u8>>, expected: Option<Vec<u8>>) -> Self {
        Self {
            column,
            key: key.into(),
            expected,
        }
    }

    pub fn absent(column: Column, key: impl Into<Vec<u8>>) -> Self {
        Self::new(column, key, None)
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Entry with the greatest key under `prefix`.
    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
    /// Applies `batch` only if every precondition holds, atomically with respect
    /// to other `commit_if` and `write_batch` calls. Returns whether it applied.
    fn commit_if(
        &self,
        preconditions: &[Precondition],
        batch: &WriteBatch,
    ) -> Result<bool, StoreError>;

    fn compare_and_swap(
        &self,
        column: Column,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(column, key, value);
        let precondition = Precondition::new(column, key, expected.map(<[u8]>::to_vec));
        self.commit_if(std::slice::from_ref(&precondition), &batch)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.as_ref().last_with_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn commit_if(
        &self,
        preconditions: &[Precondition],
        batch: &WriteBatch,
    ) -> Result<bool, StoreError> {
        self.as_ref().commit_if(preconditions, batch)
    }
}
