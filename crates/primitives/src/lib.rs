//! Native block and transaction types for the supported chain families, plus
//! the binary codec shared by the wire protocol and the on-disk records.

pub mod account;
pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;
pub mod work;

pub use account::{AccountBlock, AccountTransaction};
pub use address::script_to_address;
pub use block::{merkle_root, Block, BlockHeader};
pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use primitive_types::U256;
pub use transaction::{Transaction, TxIn, TxOut};
pub use work::block_work;
