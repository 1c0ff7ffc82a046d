//! Chain identity, network selection, and per-chain parameters.

pub mod hex;
pub mod params;

pub use hex::{
    hash256_from_hex, hash256_from_prefixed_hex, hash256_to_hex, hash256_to_prefixed_hex, HexError,
};
pub use params::{
    chain_params, AddressPrefixes, ChainFamily, ChainKey, ChainParams, Network, ParseNetworkError,
};

/// 32-byte hash in internal (wire) byte order.
pub type Hash256 = [u8; 32];
