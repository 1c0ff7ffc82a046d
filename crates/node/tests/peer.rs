mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chainidx::p2p::{read_message, write_message};
use chainidx::peer_pool::{PeerPool, PoolConfig, PoolEvent};
use chainidx::source::{Announcement, ChainSource, PeerChainSource};
use chainidx::status::StatusBoard;
use chainidx::sync::{StepOutcome, SyncConfig, SyncWorker};
use chainidx::wire::{InvKind, Inventory, VersionMessage, WireMessage, NODE_NETWORK};
use chainidx_adapter::{adapter_for, NativeBlock};
use chainidx_params::{chain_params, ChainParams, Network};
use chainidx_primitives::{encode, OutPoint};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use common::{coinbase, memory_index, payment, seed, utxo_chain};

const WAIT: Duration = Duration::from_secs(5);

fn btc_regtest() -> ChainParams {
    chain_params("BTC", Network::Regtest).expect("params")
}

/// Answers our handshake the way a full node would, advertising `height`.
async fn accept_peer(
    listener: &TcpListener,
    magic: [u8; 4],
    height: i32,
) -> (OwnedReadHalf, OwnedWriteHalf) {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("pool connected")
        .expect("accept");
    let (mut reader, mut writer) = stream.into_split();
    let ours = read_message(&mut reader, magic).await.expect("version");
    assert!(matches!(ours, WireMessage::Version(_)), "got {ours:?}");
    let theirs = VersionMessage {
        version: 70016,
        services: NODE_NETWORK,
        timestamp: 1_700_000_000,
        nonce: 42,
        user_agent: "/fake:0.1/".to_string(),
        start_height: height,
        relay: true,
    };
    write_message(&mut writer, magic, &WireMessage::Version(theirs))
        .await
        .expect("send version");
    write_message(&mut writer, magic, &WireMessage::Verack)
        .await
        .expect("send verack");
    let verack = read_message(&mut reader, magic).await.expect("verack");
    assert_eq!(verack, WireMessage::Verack);
    (reader, writer)
}

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, addr)
}

async fn next_skipping_pongs(reader: &mut OwnedReadHalf, magic: [u8; 4]) -> WireMessage {
    loop {
        let message = timeout(WAIT, read_message(reader, magic))
            .await
            .expect("message in time")
            .expect("message");
        if !matches!(message, WireMessage::Pong(_)) {
            return message;
        }
    }
}

#[tokio::test]
async fn announced_block_is_fetched_and_becomes_the_tip() {
    let params = btc_regtest();
    let magic = params.message_start;
    let key = params.key.clone();
    let blocks = utxo_chain([0; 32], 0, 0, 1, |_| Vec::new());
    let genesis = blocks[0].clone();
    let next = blocks[1].clone();
    let next_hash = next.hash();

    let index = memory_index();
    let adapter = adapter_for(&params);
    seed(&index, &adapter, &key, &NativeBlock::Utxo(genesis), 0, None);

    let (listener, addr) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut reader, mut writer) = accept_peer(&listener, magic, 1).await;
        write_message(&mut writer, magic, &WireMessage::Ping([9; 8]))
            .await
            .expect("ping");
        let pong = timeout(WAIT, read_message(&mut reader, magic))
            .await
            .expect("pong in time")
            .expect("pong");
        assert_eq!(pong, WireMessage::Pong([9; 8]));

        // The second copy must be filtered by the pool.
        for _ in 0..2 {
            write_message(&mut writer, magic, &WireMessage::Inv(vec![Inventory::block(next_hash)]))
                .await
                .expect("inv");
        }
        let request = next_skipping_pongs(&mut reader, magic).await;
        let WireMessage::GetData(items) = request else {
            panic!("expected getdata, got {request:?}");
        };
        assert_eq!(items, vec![Inventory::block(next_hash)]);
        assert_eq!(items[0].kind, InvKind::Block);
        write_message(&mut writer, magic, &WireMessage::Block(next))
            .await
            .expect("block");
        // Hold the connection until the pool hangs up.
        while read_message(&mut reader, magic).await.is_ok() {}
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, events) = PeerPool::start(&params, PoolConfig::new(vec![addr]), shutdown_rx.clone());
    let source: Arc<dyn ChainSource> = Arc::new(PeerChainSource::new(
        Arc::clone(&pool),
        events,
        params.protocol_version,
        WAIT,
    ));

    let announcement = source
        .next_announcement(WAIT)
        .await
        .expect("announcement")
        .expect("inv arrived");
    assert_eq!(announcement, Announcement::Blocks(vec![next_hash]));
    let duplicate = source
        .next_announcement(Duration::from_millis(200))
        .await
        .expect("quiet");
    assert_eq!(duplicate, None);
    assert_eq!(source.remote_tip().await.expect("remote tip"), 1);

    let mut worker = SyncWorker::new(
        key.clone(),
        index.clone(),
        adapter,
        Arc::clone(&source),
        Arc::new(StatusBoard::new()),
        SyncConfig::new(params.tie_alarm_depth),
        shutdown_rx,
    );
    let outcome = worker
        .handle_announcement(announcement)
        .await
        .expect("ingest announced block");
    assert_eq!(outcome, StepOutcome::Advanced(1));
    let tip = index.get_local_tip(&key).expect("tip").expect("some tip");
    assert_eq!((tip.height, tip.hash), (1, next_hash));

    shutdown_tx.send(true).expect("shutdown");
    timeout(WAIT, pool.join()).await.expect("pool stopped");
    timeout(WAIT, peer).await.expect("peer finished").expect("peer task");
}

#[tokio::test]
async fn broadcast_reaches_connected_peers() {
    let params = btc_regtest();
    let magic = params.message_start;
    let funding = coinbase(0, 1);
    let tx = payment(OutPoint::new(funding.txid(), 0), 10_000, 4);
    let raw = encode(&tx);
    let expected = tx.clone();

    let (listener, addr) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut reader, _writer) = accept_peer(&listener, magic, 0).await;
        let relayed = next_skipping_pongs(&mut reader, magic).await;
        assert_eq!(relayed, WireMessage::Tx(expected));
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, events) = PeerPool::start(&params, PoolConfig::new(vec![addr]), shutdown_rx);
    let source = PeerChainSource::new(Arc::clone(&pool), events, params.protocol_version, WAIT);
    pool.wait_for_peer(WAIT).await.expect("connected");

    let txid = source.broadcast(&raw).await.expect("broadcast");
    assert_eq!(txid, tx.txid());
    timeout(WAIT, peer).await.expect("peer finished").expect("peer task");

    shutdown_tx.send(true).expect("shutdown");
    timeout(WAIT, pool.join()).await.expect("pool stopped");
}

#[tokio::test]
async fn suspect_peer_is_dropped_and_banned() {
    let params = btc_regtest();
    let magic = params.message_start;
    let (listener, addr) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut reader, _writer) = accept_peer(&listener, magic, 7).await;
        while read_message(&mut reader, magic).await.is_ok() {}
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, _events) = PeerPool::start(&params, PoolConfig::new(vec![addr]), shutdown_rx);
    let mut pool_events = pool.subscribe();
    let connected = pool.wait_for_peer(WAIT).await.expect("connected");
    assert_eq!((connected.addr, connected.height), (addr, 7));
    assert_eq!(connected.user_agent, "/fake:0.1/");

    pool.mark_suspect(addr, "served an invalid block");
    let reason = timeout(WAIT, async {
        loop {
            if let PoolEvent::Disconnected { addr: gone, reason } =
                pool_events.recv().await.expect("pool event")
            {
                assert_eq!(gone, addr);
                return reason;
            }
        }
    })
    .await
    .expect("disconnected");
    assert_eq!(reason, "peer marked suspect");
    assert!(pool.is_suspect(addr));
    assert!(pool.best_peer().is_none());
    timeout(WAIT, peer).await.expect("peer finished").expect("peer task");

    shutdown_tx.send(true).expect("shutdown");
    timeout(WAIT, pool.join()).await.expect("pool stopped");
}
