//! Outbound connections for one (chain, network).
//!
//! Each configured peer gets a task that connects, handshakes, answers pings
//! and forwards every other decoded message on a single event stream. Dead or
//! silent peers are dropped and retried with exponential backoff; peers marked
//! suspect sit out a ban period while the remaining peers carry the load.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chainidx_log::{log_debug, log_info, log_warn};
use chainidx_params::{ChainKey, ChainParams, Hash256};
use rand::Rng;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::p2p;
use crate::wire::{InvKind, Inventory, WireError, WireMessage};

const BLOCK_INV_CACHE: usize = 100;
const TX_INV_CACHE: usize = 100_000;
const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;
const POOL_EVENT_QUEUE: usize = 64;
const FULL_POOL_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer {0} is not connected")]
    NotConnected(SocketAddr),
    #[error("no peer connected")]
    NoPeers,
    #[error("peer went silent")]
    Silent,
    #[error("peer marked suspect")]
    Suspect,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub peers: Vec<SocketAddr>,
    pub max_peers: usize,
    /// No inbound traffic for this long triggers a ping; another period of silence drops the peer.
    pub silence_timeout: Duration,
    pub suspect_ban: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl PoolConfig {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            max_peers: peers.len().max(1),
            peers,
            silence_timeout: Duration::from_secs(90),
            suspect_ban: Duration::from_secs(600),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub addr: SocketAddr,
    pub message: WireMessage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    Connected {
        addr: SocketAddr,
        height: i32,
        user_agent: String,
    },
    Disconnected {
        addr: SocketAddr,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub height: i32,
    pub user_agent: String,
    pub connected_since: SystemTime,
    pub last_recv: SystemTime,
}

struct PeerSlot {
    outbound: mpsc::Sender<WireMessage>,
    kick: Arc<Notify>,
    height: i32,
    user_agent: String,
    connected_since: SystemTime,
    last_recv: SystemTime,
}

impl PeerSlot {
    fn snapshot(&self, addr: SocketAddr) -> PeerSnapshot {
        PeerSnapshot {
            addr,
            height: self.height,
            user_agent: self.user_agent.clone(),
            connected_since: self.connected_since,
            last_recv: self.last_recv,
        }
    }
}

/// Bounded first-seen filter; the oldest hash is forgotten first.
struct SeenCache {
    order: VecDeque<Hash256>,
    set: HashSet<Hash256>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, hash: Hash256) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

pub struct PeerPool {
    key: ChainKey,
    params: ChainParams,
    config: PoolConfig,
    local_height: AtomicI32,
    peers: Mutex<HashMap<SocketAddr, PeerSlot>>,
    banned: Mutex<HashMap<SocketAddr, Instant>>,
    seen_blocks: Mutex<SeenCache>,
    seen_txs: Mutex<SeenCache>,
    pool_events: broadcast::Sender<PoolEvent>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerPool {
    /// Spawns one connection task per configured peer. Decoded messages arrive
    /// on the returned receiver.
    pub fn start(
        params: &ChainParams,
        config: PoolConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (pool_events, _) = broadcast::channel(POOL_EVENT_QUEUE);
        let pool = Arc::new(Self {
            key: params.key.clone(),
            params: params.clone(),
            config,
            local_height: AtomicI32::new(0),
            peers: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            seen_blocks: Mutex::new(SeenCache::new(BLOCK_INV_CACHE)),
            seen_txs: Mutex::new(SeenCache::new(TX_INV_CACHE)),
            pool_events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        let handles: Vec<_> = pool
            .config
            .peers
            .iter()
            .map(|addr| tokio::spawn(Arc::clone(&pool).connection_loop(*addr, events_tx.clone())))
            .collect();
        if let Ok(mut tasks) = pool.tasks.lock() {
            tasks.extend(handles);
        }
        (pool, events_rx)
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Height advertised in our `version` messages.
    pub fn set_local_height(&self, height: u64) {
        let height = i32::try_from(height).unwrap_or(i32::MAX);
        self.local_height.store(height, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool_events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<_> = peers.iter().map(|(addr, slot)| slot.snapshot(*addr)).collect();
        out.sort_by_key(|peer| peer.addr);
        out
    }

    pub fn connected_count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Connected, non-suspect peer with the highest announced height.
    pub fn best_peer(&self) -> Option<PeerSnapshot> {
        let peers = self.peers.lock().ok()?;
        peers
            .iter()
            .filter(|(addr, _)| !self.is_suspect(**addr))
            .max_by_key(|(addr, slot)| (slot.height, std::cmp::Reverse(**addr)))
            .map(|(addr, slot)| slot.snapshot(*addr))
    }

    pub async fn wait_for_peer(&self, wait: Duration) -> Option<PeerSnapshot> {
        let mut events = self.subscribe();
        if let Some(peer) = self.best_peer() {
            return Some(peer);
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(PoolEvent::Connected { .. })) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(peer) = self.best_peer() {
                        return Some(peer);
                    }
                }
                Ok(Ok(PoolEvent::Disconnected { .. })) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return self.best_peer(),
            }
        }
    }

    pub fn note_height(&self, addr: SocketAddr, height: u64) {
        let height = i32::try_from(height).unwrap_or(i32::MAX);
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(slot) = peers.get_mut(&addr) {
                slot.height = slot.height.max(height);
            }
        }
    }

    pub async fn send_to(&self, addr: SocketAddr, message: WireMessage) -> Result<(), PoolError> {
        let sender = self
            .peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&addr).map(|slot| slot.outbound.clone()))
            .ok_or(PoolError::NotConnected(addr))?;
        sender
            .send(message)
            .await
            .map_err(|_| PoolError::NotConnected(addr))
    }

    /// Queues `message` to every connected peer; returns how many accepted it.
    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        let senders: Vec<_> = match self.peers.lock() {
            Ok(peers) => peers.values().map(|slot| slot.outbound.clone()).collect(),
            Err(_) => return 0,
        };
        let mut sent = 0;
        for sender in senders {
            if sender.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Bans `addr` for the configured period and drops its connection.
    pub fn mark_suspect(&self, addr: SocketAddr, reason: &str) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(addr, Instant::now() + self.config.suspect_ban);
        }
        log_warn!(chain: self.key, "peer {addr} marked suspect: {reason}");
        if let Ok(peers) = self.peers.lock() {
            if let Some(slot) = peers.get(&addr) {
                slot.kick.notify_one();
            }
        }
    }

    pub fn is_suspect(&self, addr: SocketAddr) -> bool {
        self.ban_remaining(addr).is_some()
    }

    fn ban_remaining(&self, addr: SocketAddr) -> Option<Duration> {
        let mut banned = self.banned.lock().ok()?;
        let until = *banned.get(&addr)?;
        let now = Instant::now();
        if until > now {
            return Some(until - now);
        }
        banned.remove(&addr);
        None
    }

    /// Drops inventory already seen from any peer of this pool.
    pub fn filter_inventory(&self, items: Vec<Inventory>) -> Vec<Inventory> {
        items
            .into_iter()
            .filter(|item| match item.kind {
                InvKind::Block => self
                    .seen_blocks
                    .lock()
                    .map(|mut seen| seen.insert(item.hash))
                    .unwrap_or(true),
                InvKind::Tx => self
                    .seen_txs
                    .lock()
                    .map(|mut seen| seen.insert(item.hash))
                    .unwrap_or(true),
                InvKind::Other(_) => false,
            })
            .collect()
    }

    /// Waits for every connection task to exit after shutdown was signalled.
    pub async fn join(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn backoff_delay(backoff: Duration) -> Duration {
        let spread = (backoff.as_millis() as u64 / 4).max(1);
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    async fn connection_loop(self: Arc<Self>, addr: SocketAddr, events: mpsc::Sender<PeerEvent>) {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = self.config.backoff_base;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = if let Some(remaining) = self.ban_remaining(addr) {
                remaining
            } else if self.connected_count() >= self.config.max_peers {
                FULL_POOL_RECHECK
            } else {
                let mut established = false;
                let result = self
                    .run_connection(addr, &events, &mut established, &mut shutdown)
                    .await;
                if established {
                    backoff = self.config.backoff_base;
                }
                if *shutdown.borrow() || events.is_closed() {
                    break;
                }
                if let Err(err) = result {
                    log_debug!(chain: self.key, "peer {addr}: {err}");
                }
                let delay = Self::backoff_delay(backoff);
                backoff = (backoff * 2).min(self.config.backoff_max);
                delay
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_connection(
        &self,
        addr: SocketAddr,
        events: &mpsc::Sender<PeerEvent>,
        established: &mut bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        let magic = self.params.message_start;
        let stream = p2p::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        let ours = p2p::local_version(&self.params, self.local_height.load(Ordering::Relaxed));
        let theirs = p2p::handshake(&mut reader, &mut writer, magic, ours).await?;
        *established = true;

        let (outbound, mut queue) = mpsc::channel::<WireMessage>(OUTBOUND_QUEUE);
        let kick = Arc::new(Notify::new());
        let now = SystemTime::now();
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                addr,
                PeerSlot {
                    outbound: outbound.clone(),
                    kick: Arc::clone(&kick),
                    height: theirs.start_height,
                    user_agent: theirs.user_agent.clone(),
                    connected_since: now,
                    last_recv: now,
                },
            );
        }
        log_info!(
            chain: self.key,
            "connected to {addr} ({}, height {})",
            theirs.user_agent,
            theirs.start_height
        );
        let _ = self.pool_events.send(PoolEvent::Connected {
            addr,
            height: theirs.start_height,
            user_agent: theirs.user_agent,
        });

        let writer_task = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                p2p::write_message(&mut writer, magic, &message).await?;
            }
            Ok::<(), WireError>(())
        });
        let result = self
            .read_loop(addr, &mut reader, &outbound, &kick, events, shutdown)
            .await;
        writer_task.abort();

        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&addr);
        }
        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(err) => err.to_string(),
        };
        let _ = self.pool_events.send(PoolEvent::Disconnected { addr, reason });
        result
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        addr: SocketAddr,
        reader: &mut R,
        outbound: &mpsc::Sender<WireMessage>,
        kick: &Notify,
        events: &mpsc::Sender<PeerEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        let magic = self.params.message_start;
        let mut probe: Option<[u8; 8]> = None;
        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = kick.notified() => return Err(PoolError::Suspect),
                read = timeout(self.config.silence_timeout, p2p::read_message(reader, magic)) => read,
            };
            let message = match read {
                Err(_) if probe.is_some() => return Err(PoolError::Silent),
                Err(_) => {
                    let nonce: [u8; 8] = rand::random();
                    probe = Some(nonce);
                    outbound
                        .send(WireMessage::Ping(nonce))
                        .await
                        .map_err(|_| PoolError::Wire(WireError::Closed))?;
                    continue;
                }
                Ok(message) => message?,
            };
            probe = None;
            if let Ok(mut peers) = self.peers.lock() {
                if let Some(slot) = peers.get_mut(&addr) {
                    slot.last_recv = SystemTime::now();
                }
            }
            let forward = match message {
                WireMessage::Ping(nonce) => {
                    outbound
                        .send(WireMessage::Pong(nonce))
                        .await
                        .map_err(|_| PoolError::Wire(WireError::Closed))?;
                    None
                }
                WireMessage::Pong(_) | WireMessage::Version(_) | WireMessage::Verack => None,
                WireMessage::Inv(items) => {
                    let fresh = self.filter_inventory(items);
                    (!fresh.is_empty()).then_some(WireMessage::Inv(fresh))
                }
                other => Some(other),
            };
            if let Some(message) = forward {
                if events.send(PeerEvent { addr, message }).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_cache_forgets_oldest() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert([1; 32]));
        assert!(!cache.insert([1; 32]));
        assert!(cache.insert([2; 32]));
        assert!(cache.insert([3; 32]));
        assert!(cache.insert([1; 32]));
        assert!(!cache.insert([3; 32]));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        for _ in 0..64 {
            let delay = PeerPool::backoff_delay(Duration::from_secs(8));
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(10));
        }
    }
}
