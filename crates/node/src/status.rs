use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::SystemTime;

use chainidx_params::ChainKey;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Fetching,
    Processing,
    CaughtUp,
    ReorgDetected,
    Errored,
    Paused,
    Stopped,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Fetching => "fetching",
            SyncState::Processing => "processing",
            SyncState::CaughtUp => "caught_up",
            SyncState::ReorgDetected => "reorg_detected",
            SyncState::Errored => "errored",
            SyncState::Paused => "paused",
            SyncState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions an operator has to look at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degraded {
    /// Two branches carry equal work; sync is paused instead of picking one.
    ForkTie {
        ancestor_height: u64,
        local_tip: u64,
        competing_tip: u64,
        depth: u64,
    },
    ConversionFailures { count: u32, last_error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncHealth {
    pub state: SyncState,
    pub tip_height: Option<u64>,
    pub degraded: Option<Degraded>,
    #[serde(skip)]
    pub updated: SystemTime,
}

impl Default for SyncHealth {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            tip_height: None,
            degraded: None,
            updated: SystemTime::now(),
        }
    }
}

/// Health of every sync worker, keyed by (chain, network).
#[derive(Default)]
pub struct StatusBoard {
    chains: RwLock<HashMap<ChainKey, SyncHealth>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, key: &ChainKey, apply: impl FnOnce(&mut SyncHealth)) {
        if let Ok(mut chains) = self.chains.write() {
            let health = chains.entry(key.clone()).or_default();
            apply(health);
            health.updated = SystemTime::now();
        }
    }

    pub fn update_state(&self, key: &ChainKey, state: SyncState) {
        self.modify(key, |health| health.state = state);
    }

    pub fn set_tip(&self, key: &ChainKey, height: u64) {
        self.modify(key, |health| health.tip_height = Some(height));
    }

    pub fn set_degraded(&self, key: &ChainKey, degraded: Degraded) {
        self.modify(key, |health| health.degraded = Some(degraded));
    }

    pub fn clear_degraded(&self, key: &ChainKey) {
        self.modify(key, |health| health.degraded = None);
    }

    pub fn get(&self, key: &ChainKey) -> Option<SyncHealth> {
        self.chains.read().ok()?.get(key).cloned()
    }

    pub fn is_degraded(&self, key: &ChainKey) -> bool {
        self.get(key).is_some_and(|health| health.degraded.is_some())
    }

    pub fn snapshot(&self) -> Vec<(ChainKey, SyncHealth)> {
        let Ok(chains) = self.chains.read() else {
            return Vec::new();
        };
        let mut out: Vec<_> = chains
            .iter()
            .map(|(key, health)| (key.clone(), health.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainidx_params::Network;

    #[test]
    fn board_tracks_each_chain_separately() {
        let board = StatusBoard::new();
        let btc = ChainKey::new("BTC", Network::Regtest);
        let eth = ChainKey::new("ETH", Network::Mainnet);
        board.update_state(&btc, SyncState::Processing);
        board.set_tip(&btc, 7);
        board.set_degraded(
            &eth,
            Degraded::ConversionFailures {
                count: 3,
                last_error: "bad".to_string(),
            },
        );

        let health = board.get(&btc).expect("btc health");
        assert_eq!(health.state, SyncState::Processing);
        assert_eq!(health.tip_height, Some(7));
        assert!(!board.is_degraded(&btc));
        assert!(board.is_degraded(&eth));
        assert_eq!(board.get(&eth).expect("eth").state, SyncState::Idle);

        board.clear_degraded(&eth);
        assert!(!board.is_degraded(&eth));
        let keys: Vec<_> = board.snapshot().into_iter().map(|(key, _)| key.to_string()).collect();
        assert_eq!(keys, vec!["BTC:regtest", "ETH:mainnet"]);
    }

    #[test]
    fn degraded_serializes_with_kind_tag() {
        let value = serde_json::to_value(Degraded::ForkTie {
            ancestor_height: 9,
            local_tip: 12,
            competing_tip: 12,
            depth: 3,
        })
        .expect("json");
        assert_eq!(value["kind"], "fork_tie");
        assert_eq!(value["depth"], 3);
    }
}
