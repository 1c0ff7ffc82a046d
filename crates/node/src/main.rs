pub mod cache;
pub mod config;
pub mod fee;
pub mod mt_sync;
pub mod p2p;
pub mod peer_pool;
pub mod provider;
pub mod registry;
pub mod rpc_source;
pub mod source;
pub mod status;
pub mod sync;
pub mod wire;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chainidx_index::IndexStore;
use chainidx_log::{log_error, log_info, log_warn};
use chainidx_params::ChainFamily;
use chainidx_storage::memory::MemoryStore;
use chainidx_storage::KeyValueStore;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::TtlCache;
use crate::config::{Backend, ChainConfig, Cli, Upstream};
use crate::mt_sync::{RangeOutcome, RangeSync};
use crate::peer_pool::{PeerPool, PoolConfig};
use crate::registry::{ChainRegistry, ChainStateService};
use crate::rpc_source::RpcChainSource;
use crate::source::{ChainSource, PeerChainSource};
use crate::status::StatusBoard;
use crate::sync::{SyncError, SyncWorker};

const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEIGHT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

fn open_store(cli: &Cli) -> Result<Arc<dyn KeyValueStore>, String> {
    match cli.backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "fjall")]
        Backend::Fjall => {
            use chainidx_storage::fjall::{FjallOptions, FjallStore};

            const MIB: u64 = 1024 * 1024;
            let db_path = cli.data_dir.join("db");
            let options = FjallOptions {
                cache_bytes: cli.db_cache_mb.map(|mb| mb.saturating_mul(MIB)),
                write_buffer_bytes: cli.db_write_buffer_mb.map(|mb| mb.saturating_mul(MIB)),
                journal_bytes: None,
                fsync_ms: (cli.db_fsync_ms > 0).then_some(cli.db_fsync_ms),
            };
            let store = FjallStore::open_with_options(&db_path, options)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "fjall"))]
        Backend::Fjall => Err(format!(
            "fjall backend not compiled in; rerun with --backend memory (data dir {})",
            cli.data_dir.display()
        )),
    }
}

/// Everything started for one (chain, network).
struct Running {
    chain: ChainConfig,
    source: Arc<dyn ChainSource>,
    pool: Option<Arc<PeerPool>>,
}

fn start_source(chain: ChainConfig, shutdown: &watch::Receiver<bool>) -> Running {
    match &chain.upstream {
        Upstream::Peers { peers, max_peers } => {
            let mut pool_config = PoolConfig::new(peers.clone());
            pool_config.max_peers = *max_peers;
            let (pool, events) = PeerPool::start(&chain.params, pool_config, shutdown.clone());
            let source = PeerChainSource::new(
                Arc::clone(&pool),
                events,
                chain.params.protocol_version,
                PEER_REQUEST_TIMEOUT,
            );
            Running {
                source: Arc::new(source),
                pool: Some(pool),
                chain,
            }
        }
        Upstream::Rpc { url } => Running {
            source: Arc::new(RpcChainSource::new(url.clone(), chain.sync.start_height)),
            pool: None,
            chain,
        },
    }
}

/// Keeps the height we advertise to peers in step with the index.
fn publish_heights(
    pool: Arc<PeerPool>,
    status: Arc<StatusBoard>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEIGHT_PUBLISH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            if let Some(height) = status.get(pool.key()).and_then(|health| health.tip_height) {
                pool.set_local_height(height);
            }
        }
    })
}

fn spawn_worker(
    running: &Running,
    registry: &ChainRegistry,
    index: &IndexStore<dyn KeyValueStore>,
    status: &Arc<StatusBoard>,
    shutdown: &watch::Receiver<bool>,
) -> Result<JoinHandle<()>, String> {
    let key = running.chain.params.key.clone();
    let adapter = registry
        .adapter(&key.chain)
        .ok_or_else(|| format!("no adapter registered for {key}"))?;
    let worker = SyncWorker::new(
        key.clone(),
        index.clone(),
        Arc::clone(&adapter),
        Arc::clone(&running.source),
        Arc::clone(status),
        running.chain.sync.clone(),
        shutdown.clone(),
    );
    let range = running.chain.range.clone().map(|config| {
        RangeSync::new(
            key.clone(),
            index.clone(),
            adapter,
            Arc::clone(&running.source),
            Arc::clone(status),
            config,
            shutdown.clone(),
        )
    });
    Ok(tokio::spawn(async move {
        if let Some(range) = range {
            match range.run().await {
                Ok(RangeOutcome::NothingToDo) => {}
                Ok(RangeOutcome::Completed { tip }) => {
                    log_info!(chain: key, "range sync complete at height {tip}");
                }
                Ok(RangeOutcome::HandOff { height }) => {
                    log_info!(chain: key, "range sync stopped at height {height}");
                }
                Err(SyncError::Shutdown) => return,
                Err(err) => {
                    log_warn!(chain: key, "range sync failed, continuing single-threaded: {err}");
                }
            }
        }
        match worker.run().await {
            Ok(()) | Err(SyncError::Shutdown) => {}
            Err(err) => log_error!(chain: key, "sync worker stopped: {err}"),
        }
    }))
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = sigterm.recv() => {},
                    }
                }
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

pub async fn run_entry() -> Result<(), String> {
    let cli = Cli::parse();
    chainidx_log::init(cli.log_config().map_err(|err| err.to_string())?);

    let file = config::load_file(&cli.config_path()).map_err(|err| err.to_string())?;
    let chains = config::resolve_chains(&file).map_err(|err| err.to_string())?;

    fs::create_dir_all(&cli.data_dir).map_err(|err| {
        format!("failed to create data dir {}: {err}", cli.data_dir.display())
    })?;
    let _data_dir_lock = config::lock_data_dir(&cli.data_dir).map_err(|err| err.to_string())?;
    let store = open_store(&cli)?;
    let index: IndexStore<dyn KeyValueStore> = IndexStore::new(Arc::clone(&store));
    let cache = Arc::new(TtlCache::new(Arc::clone(&store), file.cache.compute_timeout()));
    let status = Arc::new(StatusBoard::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let running: Vec<Running> = chains
        .into_iter()
        .map(|chain| start_source(chain, &shutdown_rx))
        .collect();
    let registry = running
        .iter()
        .fold(
            ChainRegistry::builder(index.clone(), Arc::clone(&cache))
                .fee_policy(file.cache.fee_policy()),
            |builder, run| builder.register(run.chain.params.clone(), Some(Arc::clone(&run.source))),
        )
        .build();
    let registry = Arc::new(registry);
    // Held for the process lifetime; queries go through the facade.
    let _service = ChainStateService::new(Arc::clone(&registry));

    let mut tasks = Vec::with_capacity(running.len() * 2);
    for run in &running {
        log_info!(
            chain: run.chain.params.key,
            "starting {} sync",
            match run.chain.params.family {
                ChainFamily::Utxo => "peer",
                ChainFamily::Account => "rpc",
            }
        );
        tasks.push(spawn_worker(run, &registry, &index, &status, &shutdown_rx)?);
        if let Some(pool) = &run.pool {
            tasks.push(publish_heights(
                Arc::clone(pool),
                Arc::clone(&status),
                shutdown_rx.clone(),
            ));
        }
    }

    let mut wait = shutdown_rx.clone();
    while !*wait.borrow() {
        if wait.changed().await.is_err() {
            break;
        }
    }

    log_info!("Shutting down {} sync workers", running.len());
    for task in tasks {
        if let Err(err) = task.await {
            log_warn!("worker task ended abnormally: {err}");
        }
    }
    for run in &running {
        if let Some(pool) = &run.pool {
            pool.join().await;
        }
    }
    cache.shutdown();
    for (key, health) in status.snapshot() {
        log_info!(chain: key, "final state {} tip {:?}", health.state, health.tip_height);
    }
    Ok(())
}
