//! Where a sync worker gets blocks from.
//!
//! `ChainSource` hides whether blocks arrive over the peer wire protocol or a
//! JSON-RPC endpoint. Peer-backed chains use `PeerChainSource`; account
//! chains usually use `crate::rpc_source::RpcChainSource`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainidx_adapter::NativeBlock;
use chainidx_params::{hash256_to_hex, Hash256};
use chainidx_primitives::{block_work, decode, BlockHeader, Transaction, U256};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::peer_pool::{PeerEvent, PeerPool, PoolError};
use crate::wire::{BlockLocatorRequest, InvKind, Inventory, WireError, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("no peer available")]
    NoPeers,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("block {} is not available", hash256_to_hex(.0))]
    NotFound(Hash256),
    #[error("invalid data from source: {0}")]
    Protocol(String),
    #[error("{0} is not supported by this source")]
    Unsupported(&'static str),
}

impl SourceError {
    /// Worth retrying against the same or another peer without counting a failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::NoPeers
                | SourceError::Timeout(_)
                | SourceError::Pool(_)
                | SourceError::Wire(WireError::Closed | WireError::Timeout(_) | WireError::Io(_))
                | SourceError::Rpc(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderSummary {
    pub hash: Hash256,
    pub previous_hash: Hash256,
    /// Work contributed by this block alone, when the chain measures it.
    pub work: Option<U256>,
}

impl HeaderSummary {
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            previous_hash: header.prev_block,
            work: Some(block_work(header.bits)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Announcement {
    Blocks(Vec<Hash256>),
    Tip(u64),
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn remote_tip(&self) -> Result<u64, SourceError>;

    /// Headers following the first locator hash the source recognises. An
    /// empty locator asks for headers from the first block to index.
    async fn headers_after(&self, locator: &[Hash256]) -> Result<Vec<HeaderSummary>, SourceError>;

    /// Blocks in the order requested.
    async fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<NativeBlock>, SourceError>;

    /// Canonical blocks at heights `start..=end`, for sources addressable by height.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<NativeBlock>, SourceError> {
        let _ = (start, end);
        Err(SourceError::Unsupported("range fetch"))
    }

    /// Waits up to `wait` for news of blocks beyond the local tip.
    async fn next_announcement(&self, wait: Duration) -> Result<Option<Announcement>, SourceError>;

    /// The data last served was invalid; stop using whoever served it.
    async fn report_suspect(&self, reason: &str);

    /// Relays a serialized transaction and returns its id.
    async fn broadcast(&self, raw: &[u8]) -> Result<Hash256, SourceError>;
}

/// Drives the wire protocol over a `PeerPool`, one active peer at a time.
pub struct PeerChainSource {
    pool: Arc<PeerPool>,
    events: tokio::sync::Mutex<mpsc::Receiver<PeerEvent>>,
    announcements: Mutex<VecDeque<Announcement>>,
    active: Mutex<Option<SocketAddr>>,
    protocol_version: u32,
    request_timeout: Duration,
    peer_wait: Duration,
}

impl PeerChainSource {
    pub fn new(
        pool: Arc<PeerPool>,
        events: mpsc::Receiver<PeerEvent>,
        protocol_version: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            events: tokio::sync::Mutex::new(events),
            announcements: Mutex::new(VecDeque::new()),
            active: Mutex::new(None),
            protocol_version,
            request_timeout,
            peer_wait: request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    async fn active_peer(&self) -> Result<SocketAddr, SourceError> {
        let current = self.active.lock().ok().and_then(|active| *active);
        if let Some(addr) = current {
            let connected = self.pool.snapshot().iter().any(|peer| peer.addr == addr);
            if connected && !self.pool.is_suspect(addr) {
                return Ok(addr);
            }
        }
        let peer = self
            .pool
            .wait_for_peer(self.peer_wait)
            .await
            .ok_or(SourceError::NoPeers)?;
        if let Ok(mut active) = self.active.lock() {
            *active = Some(peer.addr);
        }
        Ok(peer.addr)
    }

    fn stash_inventory(&self, items: &[Inventory]) {
        let blocks: Vec<Hash256> = items
            .iter()
            .filter(|item| item.kind == InvKind::Block)
            .map(|item| item.hash)
            .collect();
        if blocks.is_empty() {
            return;
        }
        if let Ok(mut queue) = self.announcements.lock() {
            queue.push_back(Announcement::Blocks(blocks));
        }
    }

    async fn recv_until(
        rx: &mut mpsc::Receiver<PeerEvent>,
        deadline: Instant,
        what: &'static str,
    ) -> Result<PeerEvent, SourceError> {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(SourceError::NoPeers),
            Err(_) => Err(SourceError::Timeout(what)),
        }
    }

    async fn request_headers(
        &self,
        peer: SocketAddr,
        locator: Vec<Hash256>,
    ) -> Result<Vec<BlockHeader>, SourceError> {
        let mut rx = self.events.lock().await;
        let request = BlockLocatorRequest::new(self.protocol_version, locator);
        self.pool
            .send_to(peer, WireMessage::GetHeaders(request))
            .await?;
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let event = Self::recv_until(&mut rx, deadline, "headers").await?;
            match event.message {
                WireMessage::Headers(headers) if event.addr == peer => return Ok(headers),
                WireMessage::Inv(items) => self.stash_inventory(&items),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl ChainSource for PeerChainSource {
    async fn remote_tip(&self) -> Result<u64, SourceError> {
        self.active_peer().await?;
        let best = self.pool.best_peer().ok_or(SourceError::NoPeers)?;
        Ok(u64::try_from(best.height).unwrap_or(0))
    }

    async fn headers_after(&self, locator: &[Hash256]) -> Result<Vec<HeaderSummary>, SourceError> {
        let peer = self.active_peer().await?;
        // An unknown locator hash makes a peer answer from its genesis block.
        let request = if locator.is_empty() {
            vec![[0u8; 32]]
        } else {
            locator.to_vec()
        };
        let headers = self.request_headers(peer, request).await?;
        let mut out: Vec<HeaderSummary> = headers.iter().map(HeaderSummary::from_header).collect();
        if locator.is_empty() {
            if let Some(first) = out.first() {
                if first.previous_hash != [0u8; 32] {
                    let genesis = first.previous_hash;
                    let fetched = self.fetch_blocks(&[genesis]).await?;
                    if let Some(NativeBlock::Utxo(block)) = fetched.first() {
                        out.insert(0, HeaderSummary::from_header(&block.header));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<NativeBlock>, SourceError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let peer = self.active_peer().await?;
        let mut rx = self.events.lock().await;
        let inventory = hashes.iter().copied().map(Inventory::block).collect();
        self.pool
            .send_to(peer, WireMessage::GetData(inventory))
            .await?;
        let mut received = HashMap::with_capacity(hashes.len());
        let deadline = Instant::now() + self.request_timeout;
        while received.len() < hashes.len() {
            let event = Self::recv_until(&mut rx, deadline, "blocks").await?;
            match event.message {
                WireMessage::Block(block) if event.addr == peer => {
                    let hash = block.hash();
                    if hashes.contains(&hash) {
                        received.insert(hash, block);
                    }
                }
                WireMessage::NotFound(items) if event.addr == peer => {
                    if let Some(missing) = items.iter().find(|item| hashes.contains(&item.hash)) {
                        return Err(SourceError::NotFound(missing.hash));
                    }
                }
                WireMessage::Inv(items) => self.stash_inventory(&items),
                _ => {}
            }
        }
        hashes
            .iter()
            .map(|hash| {
                received
                    .remove(hash)
                    .map(NativeBlock::Utxo)
                    .ok_or(SourceError::NotFound(*hash))
            })
            .collect()
    }

    async fn next_announcement(&self, wait: Duration) -> Result<Option<Announcement>, SourceError> {
        if let Some(queued) = self
            .announcements
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
        {
            return Ok(Some(queued));
        }
        let mut rx = self.events.lock().await;
        let deadline = Instant::now() + wait;
        loop {
            let event = match Self::recv_until(&mut rx, deadline, "announcement").await {
                Ok(event) => event,
                Err(SourceError::Timeout(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            match event.message {
                WireMessage::Inv(items) => {
                    let blocks: Vec<Hash256> = items
                        .iter()
                        .filter(|item| item.kind == InvKind::Block)
                        .map(|item| item.hash)
                        .collect();
                    if !blocks.is_empty() {
                        return Ok(Some(Announcement::Blocks(blocks)));
                    }
                }
                WireMessage::Block(block) => {
                    return Ok(Some(Announcement::Blocks(vec![block.hash()])));
                }
                _ => {}
            }
        }
    }

    async fn report_suspect(&self, reason: &str) {
        let active = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(addr) = active {
            self.pool.mark_suspect(addr, reason);
        }
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<Hash256, SourceError> {
        let tx: Transaction =
            decode(raw).map_err(|err| SourceError::Protocol(format!("transaction: {err}")))?;
        let txid = tx.txid();
        if self.pool.broadcast(&WireMessage::Tx(tx)).await == 0 {
            return Err(SourceError::NoPeers);
        }
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_do_not_count_as_failures() {
        assert!(SourceError::Timeout("headers").is_transient());
        assert!(SourceError::Wire(WireError::Closed).is_transient());
        assert!(!SourceError::Wire(WireError::Checksum).is_transient());
        assert!(!SourceError::Protocol("bad".to_string()).is_transient());
    }

    #[test]
    fn header_summary_carries_block_work() {
        let header = BlockHeader {
            version: 1,
            prev_block: [3; 32],
            merkle_root: [4; 32],
            time: 10,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let summary = HeaderSummary::from_header(&header);
        assert_eq!(summary.previous_hash, [3; 32]);
        assert_eq!(summary.hash, header.hash());
        assert_eq!(summary.work, Some(block_work(0x207f_ffff)));
    }
}
