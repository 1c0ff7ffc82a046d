//! Read-side queries over the index, one provider per chain family.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainidx_index::{
    Balance, BlockRecord, CoinRecord, IndexError, IndexStore, TransactionRecord, TxCoins, TxFilter,
};
use chainidx_params::{hash256_to_hex, ChainFamily, ChainKey, ChainParams, Hash256, Network};
use chainidx_storage::KeyValueStore;
use futures::stream::{self, BoxStream, StreamExt};

use crate::cache::{CacheError, StalePolicy, TtlCache};
use crate::fee::{
    account_gas_prices, fee_cache_key, quartile_median, round_to_centi_gwei, utxo_fee_rates,
    FeeEstimate, FeeUnit, FEE_SAMPLE_SIZE,
};
use crate::source::{ChainSource, SourceError};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown chain {0}")]
    UnknownChain(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] SourceError),
    #[error("{0} is not available on this chain")]
    Unsupported(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Hash(Hash256),
    Height(u64),
}

#[async_trait]
pub trait ChainStateQuerier: Send + Sync {
    fn family(&self) -> ChainFamily;

    async fn balance_for_address(&self, network: Network, address: &str) -> Result<Balance, ProviderError>;

    async fn balance_for_wallet(&self, network: Network, wallet: &str) -> Result<Balance, ProviderError>;

    async fn block(&self, network: Network, id: BlockId) -> Result<BlockRecord, ProviderError>;

    async fn local_tip(&self, network: Network) -> Result<Option<BlockRecord>, ProviderError>;

    fn stream_transactions(
        &self,
        network: Network,
        filter: TxFilter,
    ) -> BoxStream<'static, Result<TransactionRecord, ProviderError>>;

    async fn transaction(&self, network: Network, txid: &Hash256) -> Result<TransactionRecord, ProviderError>;

    /// Coins a transaction spent and created.
    async fn coins_for_tx(&self, network: Network, txid: &Hash256) -> Result<TxCoins, ProviderError>;

    /// Unspent coins of every address in `wallet`.
    fn stream_utxos(
        &self,
        network: Network,
        wallet: &str,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>>;

    fn stream_address_utxos(
        &self,
        network: Network,
        address: &str,
        spendable_only: bool,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>>;

    async fn broadcast_transaction(&self, network: Network, raw: &[u8]) -> Result<Hash256, ProviderError>;

    async fn fee_estimate(
        &self,
        network: Network,
        target: u32,
        mode: Option<&str>,
    ) -> Result<FeeEstimate, ProviderError>;
}

#[derive(Clone)]
pub struct NetworkHandle {
    pub params: ChainParams,
    pub source: Option<Arc<dyn ChainSource>>,
}

#[derive(Clone, Debug)]
pub struct FeePolicy {
    pub ttl: Duration,
    pub stale: StalePolicy,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            stale: StalePolicy::ServeStale,
        }
    }
}

/// State shared by both providers: the index, the cache and the per-network handles.
#[derive(Clone)]
struct ProviderCore {
    chain: String,
    index: IndexStore<dyn KeyValueStore>,
    cache: Arc<TtlCache>,
    fees: FeePolicy,
    networks: BTreeMap<Network, NetworkHandle>,
}

impl ProviderCore {
    fn key(&self, network: Network) -> Result<ChainKey, ProviderError> {
        self.networks
            .get(&network)
            .map(|handle| handle.params.key.clone())
            .ok_or_else(|| ProviderError::UnknownChain(format!("{}:{network}", self.chain)))
    }

    fn block(&self, network: Network, id: BlockId) -> Result<BlockRecord, ProviderError> {
        let key = self.key(network)?;
        let block = match id {
            BlockId::Hash(hash) => self
                .index
                .block_by_hash(&key, &hash)?
                .filter(|block| block.processed),
            BlockId::Height(height) => self.index.block_by_height(&key, height)?,
        };
        block.ok_or_else(|| {
            ProviderError::NotFound(match id {
                BlockId::Hash(hash) => format!("block {}", hash256_to_hex(&hash)),
                BlockId::Height(height) => format!("block at height {height}"),
            })
        })
    }

    fn local_tip(&self, network: Network) -> Result<Option<BlockRecord>, ProviderError> {
        Ok(self.index.get_local_tip(&self.key(network)?)?)
    }

    fn transaction(&self, network: Network, txid: &Hash256) -> Result<TransactionRecord, ProviderError> {
        let key = self.key(network)?;
        self.index
            .visible_transaction(&key, txid)?
            .ok_or_else(|| ProviderError::NotFound(format!("transaction {}", hash256_to_hex(txid))))
    }

    fn stream_transactions(
        &self,
        network: Network,
        filter: TxFilter,
    ) -> BoxStream<'static, Result<TransactionRecord, ProviderError>> {
        let loaded = self.key(network).and_then(|key| {
            self.index
                .transactions(&key, &filter)
                .map_err(ProviderError::from)
        });
        into_stream(loaded)
    }

    async fn broadcast(&self, network: Network, raw: &[u8]) -> Result<Hash256, ProviderError> {
        let handle = self
            .networks
            .get(&network)
            .ok_or_else(|| ProviderError::UnknownChain(format!("{}:{network}", self.chain)))?;
        let source = handle
            .source
            .as_ref()
            .ok_or(ProviderError::Unsupported("broadcast"))?;
        Ok(source.broadcast(raw).await?)
    }

    async fn fee_estimate(
        &self,
        network: Network,
        target: u32,
        mode: Option<&str>,
        estimate: fn(&[TransactionRecord], u32) -> FeeEstimate,
    ) -> Result<FeeEstimate, ProviderError> {
        let key = self.key(network)?;
        let cache_key = fee_cache_key(&key, target, mode);
        let index = self.index.clone();
        let cached = self
            .cache
            .get_or_refresh_with(&cache_key, self.fees.ttl, self.fees.stale, || async move {
                let recent = index.recent_confirmed_transactions(&key, FEE_SAMPLE_SIZE)?;
                Ok::<_, IndexError>(estimate(&recent, target))
            })
            .await?;
        Ok(cached.value)
    }
}

fn into_stream<T: Send + 'static>(
    loaded: Result<Vec<T>, ProviderError>,
) -> BoxStream<'static, Result<T, ProviderError>> {
    match loaded {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(err) => stream::once(async move { Err(err) }).boxed(),
    }
}

fn utxo_estimate(recent: &[TransactionRecord], target: u32) -> FeeEstimate {
    let rates = utxo_fee_rates(recent);
    FeeEstimate {
        fee_rate: quartile_median(&rates, target),
        unit: FeeUnit::SatPerKb,
        blocks: target,
        samples: rates.len(),
    }
}

fn account_estimate(recent: &[TransactionRecord], target: u32) -> FeeEstimate {
    let prices = account_gas_prices(recent);
    FeeEstimate {
        fee_rate: round_to_centi_gwei(quartile_median(&prices, target)),
        unit: FeeUnit::Wei,
        blocks: target,
        samples: prices.len(),
    }
}

/// Coin-based chains: balances sum spendable coins.
pub struct UtxoStateProvider {
    core: ProviderCore,
}

impl UtxoStateProvider {
    pub fn new(
        chain: &str,
        index: IndexStore<dyn KeyValueStore>,
        cache: Arc<TtlCache>,
        fees: FeePolicy,
        networks: BTreeMap<Network, NetworkHandle>,
    ) -> Self {
        Self {
            core: ProviderCore {
                chain: chain.to_string(),
                index,
                cache,
                fees,
                networks,
            },
        }
    }
}

#[async_trait]
impl ChainStateQuerier for UtxoStateProvider {
    fn family(&self) -> ChainFamily {
        ChainFamily::Utxo
    }

    async fn balance_for_address(&self, network: Network, address: &str) -> Result<Balance, ProviderError> {
        let key = self.core.key(network)?;
        Ok(self
            .core
            .index
            .balance_for_address(&key, ChainFamily::Utxo, address)?)
    }

    async fn balance_for_wallet(&self, network: Network, wallet: &str) -> Result<Balance, ProviderError> {
        let key = self.core.key(network)?;
        Ok(self
            .core
            .index
            .balance_for_wallet(&key, ChainFamily::Utxo, wallet)?)
    }

    async fn block(&self, network: Network, id: BlockId) -> Result<BlockRecord, ProviderError> {
        self.core.block(network, id)
    }

    async fn local_tip(&self, network: Network) -> Result<Option<BlockRecord>, ProviderError> {
        self.core.local_tip(network)
    }

    fn stream_transactions(
        &self,
        network: Network,
        filter: TxFilter,
    ) -> BoxStream<'static, Result<TransactionRecord, ProviderError>> {
        self.core.stream_transactions(network, filter)
    }

    async fn transaction(&self, network: Network, txid: &Hash256) -> Result<TransactionRecord, ProviderError> {
        self.core.transaction(network, txid)
    }

    async fn coins_for_tx(&self, network: Network, txid: &Hash256) -> Result<TxCoins, ProviderError> {
        let key = self.core.key(network)?;
        self.core
            .index
            .coins_for_tx(&key, txid)?
            .ok_or_else(|| ProviderError::NotFound(format!("transaction {}", hash256_to_hex(txid))))
    }

    fn stream_utxos(
        &self,
        network: Network,
        wallet: &str,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>> {
        let loaded = self.core.key(network).and_then(|key| {
            self.core
                .index
                .coins_for_wallet(&key, wallet)
                .map_err(ProviderError::from)
        });
        into_stream(loaded)
    }

    fn stream_address_utxos(
        &self,
        network: Network,
        address: &str,
        spendable_only: bool,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>> {
        let loaded = self.core.key(network).and_then(|key| {
            self.core
                .index
                .coins_for_address(&key, address, spendable_only)
                .map_err(ProviderError::from)
        });
        into_stream(loaded)
    }

    async fn broadcast_transaction(&self, network: Network, raw: &[u8]) -> Result<Hash256, ProviderError> {
        self.core.broadcast(network, raw).await
    }

    async fn fee_estimate(
        &self,
        network: Network,
        target: u32,
        mode: Option<&str>,
    ) -> Result<FeeEstimate, ProviderError> {
        self.core
            .fee_estimate(network, target, mode, utxo_estimate)
            .await
    }
}

/// Account-model chains: balances replay value flows, there are no coins.
pub struct AccountStateProvider {
    core: ProviderCore,
}

impl AccountStateProvider {
    pub fn new(
        chain: &str,
        index: IndexStore<dyn KeyValueStore>,
        cache: Arc<TtlCache>,
        fees: FeePolicy,
        networks: BTreeMap<Network, NetworkHandle>,
    ) -> Self {
        Self {
            core: ProviderCore {
                chain: chain.to_string(),
                index,
                cache,
                fees,
                networks,
            },
        }
    }
}

#[async_trait]
impl ChainStateQuerier for AccountStateProvider {
    fn family(&self) -> ChainFamily {
        ChainFamily::Account
    }

    async fn balance_for_address(&self, network: Network, address: &str) -> Result<Balance, ProviderError> {
        let key = self.core.key(network)?;
        let address = address.trim().to_ascii_lowercase();
        Ok(self
            .core
            .index
            .balance_for_address(&key, ChainFamily::Account, &address)?)
    }

    async fn balance_for_wallet(&self, network: Network, wallet: &str) -> Result<Balance, ProviderError> {
        let key = self.core.key(network)?;
        Ok(self
            .core
            .index
            .balance_for_wallet(&key, ChainFamily::Account, wallet)?)
    }

    async fn block(&self, network: Network, id: BlockId) -> Result<BlockRecord, ProviderError> {
        self.core.block(network, id)
    }

    async fn local_tip(&self, network: Network) -> Result<Option<BlockRecord>, ProviderError> {
        self.core.local_tip(network)
    }

    fn stream_transactions(
        &self,
        network: Network,
        mut filter: TxFilter,
    ) -> BoxStream<'static, Result<TransactionRecord, ProviderError>> {
        filter.address = filter.address.map(|address| address.trim().to_ascii_lowercase());
        self.core.stream_transactions(network, filter)
    }

    async fn transaction(&self, network: Network, txid: &Hash256) -> Result<TransactionRecord, ProviderError> {
        self.core.transaction(network, txid)
    }

    async fn coins_for_tx(&self, _network: Network, _txid: &Hash256) -> Result<TxCoins, ProviderError> {
        Err(ProviderError::Unsupported("transaction coins"))
    }

    fn stream_utxos(
        &self,
        _network: Network,
        _wallet: &str,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>> {
        into_stream(Err(ProviderError::Unsupported("unspent outputs")))
    }

    fn stream_address_utxos(
        &self,
        _network: Network,
        _address: &str,
        _spendable_only: bool,
    ) -> BoxStream<'static, Result<CoinRecord, ProviderError>> {
        into_stream(Err(ProviderError::Unsupported("unspent outputs")))
    }

    async fn broadcast_transaction(&self, network: Network, raw: &[u8]) -> Result<Hash256, ProviderError> {
        self.core.broadcast(network, raw).await
    }

    async fn fee_estimate(
        &self,
        network: Network,
        target: u32,
        mode: Option<&str>,
    ) -> Result<FeeEstimate, ProviderError> {
        self.core
            .fee_estimate(network, target, mode, account_estimate)
            .await
    }
}
