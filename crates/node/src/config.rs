//! Command line, chains file and data directory lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chainidx_log::{Format, Level, LogConfig};
use chainidx_params::{chain_params, ChainFamily, ChainParams, Network};
use clap::{Parser, ValueEnum};
use fs2::FileExt;
use serde::Deserialize;

use crate::cache::StalePolicy;
use crate::mt_sync::RangeSyncConfig;
use crate::provider::FeePolicy;
use crate::sync::SyncConfig;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DEFAULT_CONFIG_FILE_NAME: &str = "chainidx.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Network(#[from] chainidx_params::ParseNetworkError),
    #[error("unsupported chain {0}")]
    UnknownChain(String),
    #[error("{0} is configured twice")]
    Duplicate(String),
    #[error("{0}: coin-based chains need at least one peer")]
    MissingPeers(String),
    #[error("{0}: account chains need rpc_url")]
    MissingRpcUrl(String),
    #[error("{chain}: invalid peer {peer}: {reason}")]
    InvalidPeer {
        chain: String,
        peer: String,
        reason: String,
    },
    #[error("{chain}: invalid message_start {raw}")]
    InvalidMagic { chain: String, raw: String },
    #[error("invalid log {what} {raw}")]
    InvalidLog { what: &'static str, raw: String },
    #[error("no chains configured")]
    NoChains,
    #[error("{0}")]
    Lock(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Fjall,
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "chainidx", version, about = "Multi-chain block sync and indexer")]
pub struct Cli {
    /// Chains file; defaults to <data-dir>/chainidx.toml.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    #[arg(long, value_name = "DIR", default_value = "./data")]
    pub data_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Backend::Fjall)]
    pub backend: Backend,
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[arg(long, default_value = "text")]
    pub log_format: String,
    #[arg(long)]
    pub no_log_timestamps: bool,
    /// Block cache of the fjall backend.
    #[arg(long, value_name = "MB")]
    pub db_cache_mb: Option<u64>,
    #[arg(long, value_name = "MB")]
    pub db_write_buffer_mb: Option<u64>,
    /// Journal fsync interval; 0 leaves flushing to the OS.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub db_fsync_ms: u16,
}

impl Cli {
    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        let level = Level::parse(&self.log_level).ok_or_else(|| ConfigError::InvalidLog {
            what: "level",
            raw: self.log_level.clone(),
        })?;
        let format = Format::parse(&self.log_format).ok_or_else(|| ConfigError::InvalidLog {
            what: "format",
            raw: self.log_format.clone(),
        })?;
        Ok(LogConfig {
            level,
            format,
            timestamps: !self.no_log_timestamps,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_CONFIG_FILE_NAME))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub chains: Vec<ChainSection>,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSection {
    pub chain: String,
    pub network: String,
    #[serde(default)]
    pub peers: Vec<String>,
    pub max_peers: Option<usize>,
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub start_height: u64,
    pub port: Option<u16>,
    pub protocol_version: Option<u32>,
    /// Hex, four bytes.
    pub message_start: Option<String>,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub threads: usize,
    pub range_size: u64,
    pub tip_pad: u64,
    pub tie_alarm_depth: Option<u32>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            threads: 1,
            range_size: 100,
            tip_pad: 100,
            tie_alarm_depth: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub fee_ttl_secs: u64,
    pub compute_timeout_secs: u64,
    pub serve_stale: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            fee_ttl_secs: 60,
            compute_timeout_secs: 10,
            serve_stale: true,
        }
    }
}

impl CacheSection {
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            ttl: Duration::from_secs(self.fee_ttl_secs),
            stale: if self.serve_stale {
                StalePolicy::ServeStale
            } else {
                StalePolicy::Fail
            },
        }
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs.max(1))
    }
}

/// How a configured chain reaches its network.
#[derive(Clone, Debug)]
pub enum Upstream {
    Peers { peers: Vec<SocketAddr>, max_peers: usize },
    Rpc { url: String },
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub params: ChainParams,
    pub upstream: Upstream,
    pub sync: SyncConfig,
    /// Present when more than one sync thread is configured.
    pub range: Option<RangeSyncConfig>,
}

pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_file(raw: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(raw)
}

/// Validates every chain section and fills in per-chain defaults.
pub fn resolve_chains(file: &FileConfig) -> Result<Vec<ChainConfig>, ConfigError> {
    if file.chains.is_empty() {
        return Err(ConfigError::NoChains);
    }
    let mut out: Vec<ChainConfig> = Vec::with_capacity(file.chains.len());
    for section in &file.chains {
        let resolved = resolve_chain(section)?;
        if out.iter().any(|other| other.params.key == resolved.params.key) {
            return Err(ConfigError::Duplicate(resolved.params.key.to_string()));
        }
        out.push(resolved);
    }
    Ok(out)
}

fn resolve_chain(section: &ChainSection) -> Result<ChainConfig, ConfigError> {
    let network = Network::parse(&section.network)?;
    let mut params = chain_params(&section.chain, network)
        .ok_or_else(|| ConfigError::UnknownChain(section.chain.clone()))?;
    let label = params.key.to_string();
    if let Some(port) = section.port {
        params.default_port = port;
    }
    if let Some(version) = section.protocol_version {
        params.protocol_version = version;
    }
    if let Some(raw) = &section.message_start {
        params.message_start = parse_magic(raw).ok_or_else(|| ConfigError::InvalidMagic {
            chain: label.clone(),
            raw: raw.clone(),
        })?;
    }
    if let Some(depth) = section.sync.tie_alarm_depth {
        params.tie_alarm_depth = depth;
    }

    let upstream = match params.family {
        ChainFamily::Utxo => {
            if section.peers.is_empty() {
                return Err(ConfigError::MissingPeers(label));
            }
            let peers = section
                .peers
                .iter()
                .map(|peer| resolve_peer(&label, peer, params.default_port))
                .collect::<Result<Vec<_>, _>>()?;
            Upstream::Peers {
                max_peers: section.max_peers.unwrap_or(peers.len()).max(1),
                peers,
            }
        }
        ChainFamily::Account => {
            let url = section
                .rpc_url
                .as_ref()
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingRpcUrl(label.clone()))?;
            Upstream::Rpc {
                url: url.trim().to_string(),
            }
        }
    };

    let mut sync = SyncConfig::new(params.tie_alarm_depth);
    sync.start_height = section.start_height;
    let range = (params.family == ChainFamily::Account && section.sync.threads > 1).then(|| {
        RangeSyncConfig {
            threads: section.sync.threads,
            range_size: section.sync.range_size.max(1),
            tip_pad: section.sync.tip_pad,
            start_height: section.start_height,
            ..RangeSyncConfig::default()
        }
    });
    Ok(ChainConfig {
        params,
        upstream,
        sync,
        range,
    })
}

fn parse_magic(raw: &str) -> Option<[u8; 4]> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(raw).ok()?.try_into().ok()
}

/// `host:port`, `host`, or a bracketed IPv6 literal; the default port fills a missing port.
fn resolve_peer(chain: &str, peer: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPeer {
        chain: chain.to_string(),
        peer: peer.to_string(),
        reason,
    };
    let peer = peer.trim();
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = peer.trim_matches(|c| c == '[' || c == ']').parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let with_port = match peer.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => peer.to_string(),
        _ => format!("{peer}:{default_port}"),
    };
    with_port
        .to_socket_addrs()
        .map_err(|err| invalid(err.to_string()))?
        .next()
        .ok_or_else(|| invalid("no address".to_string()))
}

pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, ConfigError> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| {
            ConfigError::Lock(format!(
                "failed to open lock file {}: {err}",
                lock_path.display()
            ))
        })?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(ConfigError::Lock(format!(
                "data dir {} is already locked (another chainidx instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            )))
        }
        Err(err) => Err(ConfigError::Lock(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        ))),
    }
}
