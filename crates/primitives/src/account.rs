//! Account-model blocks as served by an external node's JSON-RPC feed.
//!
//! Quantities arrive as `0x`-prefixed hex strings, hashes in natural byte
//! order. Values that can exceed 64 bits (wei amounts, gas prices, total
//! difficulty) are kept as `U256`.

use chainidx_params::Hash256;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBlock {
    #[serde(with = "quantity")]
    pub number: u64,
    #[serde(with = "hash")]
    pub hash: Hash256,
    #[serde(with = "hash")]
    pub parent_hash: Hash256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(with = "quantity", default)]
    pub nonce: u64,
    #[serde(with = "hash")]
    pub transactions_root: Hash256,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_difficulty: Option<U256>,
    #[serde(with = "quantity")]
    pub size: u64,
    pub miner: String,
    #[serde(default)]
    pub transactions: Vec<AccountTransaction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTransaction {
    #[serde(with = "hash")]
    pub hash: Hash256,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub value: U256,
    #[serde(with = "quantity")]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: U256,
    #[serde(with = "quantity")]
    pub nonce: u64,
    #[serde(with = "data", default)]
    pub input: Vec<u8>,
    /// Gas actually consumed, when the feed includes receipts.
    #[serde(with = "opt_quantity", default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
}

impl AccountTransaction {
    /// Fee paid: consumed gas (or the gas limit without a receipt) times gas price.
    pub fn fee(&self) -> Option<U256> {
        let gas = U256::from(self.gas_used.unwrap_or(self.gas));
        gas.checked_mul(self.gas_price)
    }

    pub fn serialized_size(&self) -> usize {
        // Canonical RLP is not reproduced; size approximates the signed payload.
        self.input.len() + 110
    }
}

pub mod quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<u64, String> {
        let digits = raw
            .strip_prefix("0x")
            .ok_or_else(|| format!("quantity {raw} lacks 0x prefix"))?;
        if digits.is_empty() {
            return Err("empty quantity".to_string());
        }
        u64::from_str_radix(digits, 16).map_err(|err| format!("quantity {raw}: {err}"))
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }
}

pub mod opt_quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::quantity::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::quantity::parse(&raw).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

pub mod hash {
    use chainidx_params::{hash256_from_prefixed_hex, hash256_to_prefixed_hex, Hash256};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Hash256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash256_to_prefixed_hex(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hash256_from_prefixed_hex(&raw).map_err(|err| D::Error::custom(format!("hash {raw}: {err}")))
    }
}

pub mod data {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(digits).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_json() -> serde_json::Value {
        serde_json::json!({
            "number": "0x10",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "timestamp": "0x5f5e100",
            "nonce": "0x0000000000000000",
            "transactionsRoot": format!("0x{}", "33".repeat(32)),
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x7",
            "size": "0x220",
            "miner": "0x0000000000000000000000000000000000000001",
            "transactions": [{
                "hash": format!("0x{}", "44".repeat(32)),
                "from": "0xaa00000000000000000000000000000000000001",
                "to": null,
                "value": "0xde0b6b3a7640000",
                "gas": "0x5208",
                "gasPrice": "0x3b9aca00",
                "nonce": "0x1",
                "input": "0x"
            }]
        })
    }

    #[test]
    fn parses_rpc_block() {
        let block: AccountBlock = serde_json::from_value(block_json()).expect("block json");
        assert_eq!(block.number, 16);
        assert_eq!(block.hash, [0x11; 32]);
        assert_eq!(block.base_fee_per_gas, Some(U256::from(7u8)));
        assert_eq!(block.transactions.len(), 1);
        let tx = &block.transactions[0];
        assert_eq!(tx.to, None);
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u64));
        assert_eq!(tx.fee(), Some(U256::from(21_000u64 * 1_000_000_000)));
    }

    #[test]
    fn quantity_requires_prefix() {
        assert_eq!(quantity::parse("0x1f"), Ok(31));
        assert!(quantity::parse("1f").is_err());
        assert!(quantity::parse("0x").is_err());
    }
}
