//! Chain ticker to adapter, querier and per-network parameters.
//!
//! Built once at start-up from configuration and shared by reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use chainidx_adapter::{adapter_for, ChainAdapter};
use chainidx_index::{
    Balance, BlockRecord, CoinRecord, IndexStore, TransactionRecord, TxCoins, TxFilter,
};
use chainidx_params::{ChainFamily, ChainKey, ChainParams, Hash256, Network};
use chainidx_storage::KeyValueStore;
use futures::stream::BoxStream;

use crate::cache::TtlCache;
use crate::fee::FeeEstimate;
use crate::provider::{
    AccountStateProvider, BlockId, ChainStateQuerier, FeePolicy, NetworkHandle, ProviderError,
    UtxoStateProvider,
};
use crate::source::ChainSource;

pub struct ChainEntry {
    pub chain: String,
    pub family: ChainFamily,
    pub adapter: Arc<dyn ChainAdapter>,
    pub querier: Arc<dyn ChainStateQuerier>,
    pub networks: BTreeMap<Network, ChainParams>,
}

#[derive(Default)]
pub struct ChainRegistry {
    chains: BTreeMap<String, ChainEntry>,
}

impl ChainRegistry {
    pub fn builder(index: IndexStore<dyn KeyValueStore>, cache: Arc<TtlCache>) -> RegistryBuilder {
        RegistryBuilder {
            index,
            cache,
            fees: FeePolicy::default(),
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, chain: &str) -> Option<&ChainEntry> {
        self.chains.get(&chain.trim().to_ascii_uppercase())
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainEntry> {
        self.chains.values()
    }

    pub fn params(&self, key: &ChainKey) -> Option<&ChainParams> {
        self.get(&key.chain)?.networks.get(&key.network)
    }

    pub fn adapter(&self, chain: &str) -> Option<Arc<dyn ChainAdapter>> {
        self.get(chain).map(|entry| Arc::clone(&entry.adapter))
    }
}

pub struct RegistryBuilder {
    index: IndexStore<dyn KeyValueStore>,
    cache: Arc<TtlCache>,
    fees: FeePolicy,
    pending: BTreeMap<String, BTreeMap<Network, NetworkHandle>>,
}

impl RegistryBuilder {
    pub fn fee_policy(mut self, fees: FeePolicy) -> Self {
        self.fees = fees;
        self
    }

    /// Adds one (chain, network). `source` is used for broadcasts.
    pub fn register(mut self, params: ChainParams, source: Option<Arc<dyn ChainSource>>) -> Self {
        self.pending
            .entry(params.key.chain.clone())
            .or_default()
            .insert(params.key.network, NetworkHandle { params, source });
        self
    }

    pub fn build(self) -> ChainRegistry {
        let mut chains = BTreeMap::new();
        for (chain, networks) in self.pending {
            let Some(first) = networks.values().next() else {
                continue;
            };
            let family = first.params.family;
            let adapter = adapter_for(&first.params);
            let params: BTreeMap<Network, ChainParams> = networks
                .iter()
                .map(|(network, handle)| (*network, handle.params.clone()))
                .collect();
            let querier: Arc<dyn ChainStateQuerier> = match family {
                ChainFamily::Utxo => Arc::new(UtxoStateProvider::new(
                    &chain,
                    self.index.clone(),
                    Arc::clone(&self.cache),
                    self.fees.clone(),
                    networks,
                )),
                ChainFamily::Account => Arc::new(AccountStateProvider::new(
                    &chain,
                    self.index.clone(),
                    Arc::clone(&self.cache),
                    self.fees.clone(),
                    networks,
                )),
            };
            chains.insert(
                chain.clone(),
                ChainEntry {
                    chain,
                    family,
                    adapter,
                    querier,
                    networks: params,
                },
            );
        }
        ChainRegistry { chains }
    }
}

/// Query facade: every call names its (chain, network) explicitly.
#[derive(Clone)]
pub struct ChainStateService {
    registry: Arc<ChainRegistry>,
}

impl ChainStateService {
    pub fn new(registry: Arc<ChainRegistry>) -> Self {
        Self { registry }
    }

    pub fn provider(&self, chain: &str) -> Result<Arc<dyn ChainStateQuerier>, ProviderError> {
        self.registry
            .get(chain)
            .map(|entry| Arc::clone(&entry.querier))
            .ok_or_else(|| ProviderError::UnknownChain(chain.to_string()))
    }

    pub async fn balance_for_address(
        &self,
        chain: &str,
        network: Network,
        address: &str,
    ) -> Result<Balance, ProviderError> {
        self.provider(chain)?
            .balance_for_address(network, address)
            .await
    }

    pub async fn balance_for_wallet(
        &self,
        chain: &str,
        network: Network,
        wallet: &str,
    ) -> Result<Balance, ProviderError> {
        self.provider(chain)?.balance_for_wallet(network, wallet).await
    }

    pub async fn block(&self, chain: &str, network: Network, id: BlockId) -> Result<BlockRecord, ProviderError> {
        self.provider(chain)?.block(network, id).await
    }

    pub async fn local_tip(&self, chain: &str, network: Network) -> Result<Option<BlockRecord>, ProviderError> {
        self.provider(chain)?.local_tip(network).await
    }

    pub fn stream_transactions(
        &self,
        chain: &str,
        network: Network,
        filter: TxFilter,
    ) -> Result<BoxStream<'static, Result<TransactionRecord, ProviderError>>, ProviderError> {
        Ok(self.provider(chain)?.stream_transactions(network, filter))
    }

    pub async fn transaction(
        &self,
        chain: &str,
        network: Network,
        txid: &Hash256,
    ) -> Result<TransactionRecord, ProviderError> {
        self.provider(chain)?.transaction(network, txid).await
    }

    pub async fn coins_for_tx(
        &self,
        chain: &str,
        network: Network,
        txid: &Hash256,
    ) -> Result<TxCoins, ProviderError> {
        self.provider(chain)?.coins_for_tx(network, txid).await
    }

    /// Unspent coins of a wallet.
    pub fn stream_utxos(
        &self,
        chain: &str,
        network: Network,
        wallet: &str,
    ) -> Result<BoxStream<'static, Result<CoinRecord, ProviderError>>, ProviderError> {
        Ok(self.provider(chain)?.stream_utxos(network, wallet))
    }

    pub fn stream_address_utxos(
        &self,
        chain: &str,
        network: Network,
        address: &str,
        spendable_only: bool,
    ) -> Result<BoxStream<'static, Result<CoinRecord, ProviderError>>, ProviderError> {
        Ok(self
            .provider(chain)?
            .stream_address_utxos(network, address, spendable_only))
    }

    pub async fn broadcast_transaction(
        &self,
        chain: &str,
        network: Network,
        raw: &[u8],
    ) -> Result<Hash256, ProviderError> {
        self.provider(chain)?
            .broadcast_transaction(network, raw)
            .await
    }

    pub async fn fee_estimate(
        &self,
        chain: &str,
        network: Network,
        target: u32,
        mode: Option<&str>,
    ) -> Result<FeeEstimate, ProviderError> {
        self.provider(chain)?
            .fee_estimate(network, target, mode)
            .await
    }
}
