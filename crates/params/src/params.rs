//! Per-chain network parameters.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("unknown network {0}")]
pub struct ParseNetworkError(pub String);

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseNetworkError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "livenet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" | "testnet3" | "sepolia" => Ok(Network::Testnet),
            "regtest" | "devnet" => Ok(Network::Regtest),
            _ => Err(ParseNetworkError(raw.to_string())),
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
            Network::Regtest => 2,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChainFamily {
    Utxo,
    Account,
}

impl ChainFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainFamily::Utxo => "utxo",
            ChainFamily::Account => "account",
        }
    }
}

/// A (chain, network) pair. Every record, worker, and log scope is keyed by one.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChainKey {
    pub chain: String,
    pub network: Network,
}

impl ChainKey {
    pub fn new(chain: &str, network: Network) -> Self {
        Self {
            chain: chain.trim().to_ascii_uppercase(),
            network,
        }
    }

    /// Stable key prefix: chain ticker length, ticker bytes, network tag.
    pub fn prefix(&self) -> Vec<u8> {
        let chain = self.chain.as_bytes();
        let mut out = Vec::with_capacity(chain.len() + 2);
        out.push(chain.len() as u8);
        out.extend_from_slice(chain);
        out.push(self.network.tag());
        out
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.network)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressPrefixes {
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub bech32_hrp: Option<&'static str>,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub key: ChainKey,
    pub family: ChainFamily,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub protocol_version: u32,
    pub address: AddressPrefixes,
    pub chain_id: Option<u64>,
    /// Depth of an equal-work competing branch at which sync pauses for an operator.
    pub tie_alarm_depth: u32,
}

const NO_ADDRESS: AddressPrefixes = AddressPrefixes {
    pubkey_hash: 0,
    script_hash: 0,
    bech32_hrp: None,
};

const UTXO_TIE_ALARM_DEPTH: u32 = 6;
const ACCOUNT_TIE_ALARM_DEPTH: u32 = 12;

pub fn chain_params(chain: &str, network: Network) -> Option<ChainParams> {
    let key = ChainKey::new(chain, network);
    let params = match (key.chain.as_str(), network) {
        ("BTC", Network::Mainnet) => utxo(key, [0xf9, 0xbe, 0xb4, 0xd9], 8333, 70016, 0x00, 0x05, Some("bc")),
        ("BTC", Network::Testnet) => utxo(key, [0x0b, 0x11, 0x09, 0x07], 18333, 70016, 0x6f, 0xc4, Some("tb")),
        ("BTC", Network::Regtest) => utxo(key, [0xfa, 0xbf, 0xb5, 0xda], 18444, 70016, 0x6f, 0xc4, Some("bcrt")),
        ("BCH", Network::Mainnet) => utxo(key, [0xe3, 0xe1, 0xf3, 0xe8], 8333, 70015, 0x00, 0x05, None),
        ("BCH", Network::Testnet) => utxo(key, [0xf4, 0xe5, 0xf3, 0xf4], 18333, 70015, 0x6f, 0xc4, None),
        ("BCH", Network::Regtest) => utxo(key, [0xda, 0xb5, 0xbf, 0xfa], 18444, 70015, 0x6f, 0xc4, None),
        ("LTC", Network::Mainnet) => utxo(key, [0xfb, 0xc0, 0xb6, 0xdb], 9333, 70015, 0x30, 0x32, Some("ltc")),
        ("LTC", Network::Testnet) => utxo(key, [0xfd, 0xd2, 0xc8, 0xf1], 19335, 70015, 0x6f, 0x3a, Some("tltc")),
        ("LTC", Network::Regtest) => utxo(key, [0xfa, 0xbf, 0xb5, 0xda], 19444, 70015, 0x6f, 0x3a, Some("rltc")),
        ("DOGE", Network::Mainnet) => utxo(key, [0xc0, 0xc0, 0xc0, 0xc0], 22556, 70015, 0x1e, 0x16, None),
        ("DOGE", Network::Testnet) => utxo(key, [0xfc, 0xc1, 0xb7, 0xdc], 44556, 70015, 0x71, 0xc4, None),
        ("DOGE", Network::Regtest) => utxo(key, [0xfa, 0xbf, 0xb5, 0xda], 18444, 70015, 0x6f, 0xc4, None),
        ("ETH", Network::Mainnet) => account(key, 1),
        ("ETH", Network::Testnet) => account(key, 11_155_111),
        ("ETH", Network::Regtest) => account(key, 1337),
        ("MATIC", Network::Mainnet) => account(key, 137),
        ("MATIC", Network::Testnet) => account(key, 80_002),
        ("MATIC", Network::Regtest) => account(key, 1337),
        _ => return None,
    };
    Some(params)
}

fn utxo(
    key: ChainKey,
    message_start: [u8; 4],
    default_port: u16,
    protocol_version: u32,
    pubkey_hash: u8,
    script_hash: u8,
    bech32_hrp: Option<&'static str>,
) -> ChainParams {
    ChainParams {
        key,
        family: ChainFamily::Utxo,
        message_start,
        default_port,
        protocol_version,
        address: AddressPrefixes {
            pubkey_hash,
            script_hash,
            bech32_hrp,
        },
        chain_id: None,
        tie_alarm_depth: UTXO_TIE_ALARM_DEPTH,
    }
}

fn account(key: ChainKey, chain_id: u64) -> ChainParams {
    ChainParams {
        key,
        family: ChainFamily::Account,
        message_start: [0u8; 4],
        default_port: 8545,
        protocol_version: 0,
        address: NO_ADDRESS,
        chain_id: Some(chain_id),
        tie_alarm_depth: ACCOUNT_TIE_ALARM_DEPTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_chains_resolve() {
        let btc = chain_params("btc", Network::Mainnet).expect("btc");
        assert_eq!(btc.key.chain, "BTC");
        assert_eq!(btc.family, ChainFamily::Utxo);
        assert_eq!(btc.message_start, [0xf9, 0xbe, 0xb4, 0xd9]);

        let eth = chain_params("ETH", Network::Testnet).expect("eth");
        assert_eq!(eth.family, ChainFamily::Account);
        assert_eq!(eth.chain_id, Some(11_155_111));

        assert!(chain_params("XYZ", Network::Mainnet).is_none());
    }

    #[test]
    fn network_parse_accepts_aliases() {
        assert_eq!(Network::parse("livenet"), Ok(Network::Mainnet));
        assert_eq!(Network::parse("Regtest"), Ok(Network::Regtest));
        assert!(Network::parse("moon").is_err());
    }

    #[test]
    fn key_prefixes_do_not_collide_across_networks() {
        let main = ChainKey::new("BTC", Network::Mainnet).prefix();
        let test = ChainKey::new("BTC", Network::Testnet).prefix();
        let other = ChainKey::new("BTCX", Network::Mainnet).prefix();
        assert_ne!(main, test);
        assert!(!other.starts_with(&main));
    }
}
