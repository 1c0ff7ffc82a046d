//! Typed peer messages and their payload codecs.
//!
//! Integers are little-endian, hashes are 32 raw bytes. A payload that runs
//! short or leaves bytes unconsumed is a protocol error and costs the peer its
//! connection.

use chainidx_params::Hash256;
use chainidx_primitives::{
    Block, BlockHeader, Decodable, DecodeError, Decoder, Encodable, Encoder, Transaction,
};

pub const MAX_LOCATOR_HASHES: usize = 500;
pub const MAX_INV_ENTRIES: usize = 50_000;
pub const MAX_HEADERS_RESULTS: usize = 2_000;
pub const NODE_NETWORK: u64 = 1;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed {command} payload: {source}")]
    Decode {
        command: String,
        #[source]
        source: DecodeError,
    },
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("invalid magic")]
    Magic,
    #[error("invalid payload checksum")]
    Checksum,
    #[error("payload too large ({0} bytes)")]
    Oversized(usize),
    #[error("peer {0} timed out")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::Closed,
            _ => WireError::Io(err.to_string()),
        }
    }
}

fn malformed(command: &str) -> impl FnOnce(DecodeError) -> WireError + '_ {
    move |source| WireError::Decode {
        command: command.to_string(),
        source,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
    Other(u32),
}

impl InvKind {
    pub fn tag(self) -> u32 {
        match self {
            InvKind::Tx => MSG_TX,
            InvKind::Block => MSG_BLOCK,
            InvKind::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: u32) -> Self {
        match tag {
            MSG_TX => InvKind::Tx,
            MSG_BLOCK => InvKind::Block,
            other => InvKind::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inventory {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }
}

/// Payload of `getblocks` and `getheaders`. An all-zero `stop` asks for as
/// many entries as the peer will send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLocatorRequest {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

impl BlockLocatorRequest {
    pub fn new(version: u32, locator: Vec<Hash256>) -> Self {
        Self {
            version,
            locator,
            stop: [0u8; 32],
        }
    }

    /// Builds a request from untyped hash slices, rejecting any that is not 32 bytes.
    pub fn from_slices(version: u32, locator: &[&[u8]], stop: &[u8]) -> Result<Self, WireError> {
        let to_hash = |raw: &[u8]| -> Result<Hash256, WireError> {
            raw.try_into()
                .map_err(|_| WireError::Schema(format!("hash of {} bytes, expected 32", raw.len())))
        };
        let locator = locator
            .iter()
            .map(|raw| to_hash(*raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            version,
            locator,
            stop: to_hash(stop)?,
        })
    }

    fn encode_into(&self, encoder: &mut Encoder) -> Result<(), WireError> {
        if self.locator.len() > MAX_LOCATOR_HASHES {
            return Err(WireError::Schema(format!(
                "{} locator hashes exceed the limit of {MAX_LOCATOR_HASHES}",
                self.locator.len()
            )));
        }
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.locator.len() as u64);
        for hash in &self.locator {
            encoder.write_hash(hash);
        }
        encoder.write_hash(&self.stop);
        Ok(())
    }

    /// Keeps at most `MAX_LOCATOR_HASHES`; the excess is read and dropped.
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let count = decoder.read_count()?;
        if count.saturating_mul(32) > decoder.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut locator = Vec::with_capacity(count.min(MAX_LOCATOR_HASHES));
        for _ in 0..count {
            let hash = decoder.read_hash()?;
            if locator.len() < MAX_LOCATOR_HASHES {
                locator.push(hash);
            }
        }
        let stop = decoder.read_hash()?;
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u64_le(self.services);
        encoder.write_i64_le(self.timestamp);
        write_net_addr(encoder, self.services);
        write_net_addr(encoder, self.services);
        encoder.write_u64_le(self.nonce);
        encoder.write_var_str(&self.user_agent);
        encoder.write_i32_le(self.start_height);
        encoder.write_bool(self.relay);
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let services = decoder.read_u64_le()?;
        let timestamp = decoder.read_i64_le()?;
        skip_net_addr(decoder)?;
        skip_net_addr(decoder)?;
        let nonce = decoder.read_u64_le()?;
        let user_agent = decoder.read_var_str()?;
        let start_height = decoder.read_i32_le()?;
        // Pre-BIP37 peers omit the relay flag.
        let relay = if decoder.is_empty() {
            true
        } else {
            decoder.read_bool()?
        };
        Ok(Self {
            version,
            services,
            timestamp,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

fn write_net_addr(encoder: &mut Encoder, services: u64) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&[0u8; 16]);
    encoder.write_bytes(&0u16.to_be_bytes());
}

fn skip_net_addr(decoder: &mut Decoder) -> Result<(), DecodeError> {
    decoder.skip(8 + 16 + 2)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Version(VersionMessage),
    Verack,
    Ping([u8; 8]),
    Pong([u8; 8]),
    GetBlocks(BlockLocatorRequest),
    GetHeaders(BlockLocatorRequest),
    Headers(Vec<BlockHeader>),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Block(Block),
    Tx(Transaction),
    Unknown { command: String, payload: Vec<u8> },
}

impl WireMessage {
    pub fn command(&self) -> &str {
        match self {
            WireMessage::Version(_) => "version",
            WireMessage::Verack => "verack",
            WireMessage::Ping(_) => "ping",
            WireMessage::Pong(_) => "pong",
            WireMessage::GetBlocks(_) => "getblocks",
            WireMessage::GetHeaders(_) => "getheaders",
            WireMessage::Headers(_) => "headers",
            WireMessage::Inv(_) => "inv",
            WireMessage::GetData(_) => "getdata",
            WireMessage::NotFound(_) => "notfound",
            WireMessage::Block(_) => "block",
            WireMessage::Tx(_) => "tx",
            WireMessage::Unknown { command, .. } => command,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut encoder = Encoder::new();
        match self {
            WireMessage::Version(version) => version.encode_into(&mut encoder),
            WireMessage::Verack => {}
            WireMessage::Ping(nonce) | WireMessage::Pong(nonce) => encoder.write_bytes(nonce),
            WireMessage::GetBlocks(request) | WireMessage::GetHeaders(request) => {
                request.encode_into(&mut encoder)?
            }
            WireMessage::Headers(headers) => {
                if headers.len() > MAX_HEADERS_RESULTS {
                    return Err(WireError::Schema(format!("{} headers in one message", headers.len())));
                }
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode(&mut encoder);
                    encoder.write_varint(0);
                }
            }
            WireMessage::Inv(items) | WireMessage::GetData(items) | WireMessage::NotFound(items) => {
                if items.len() > MAX_INV_ENTRIES {
                    return Err(WireError::Schema(format!("{} inventory entries", items.len())));
                }
                encoder.write_varint(items.len() as u64);
                for item in items {
                    encoder.write_u32_le(item.kind.tag());
                    encoder.write_hash(&item.hash);
                }
            }
            WireMessage::Block(block) => block.consensus_encode(&mut encoder),
            WireMessage::Tx(tx) => tx.consensus_encode(&mut encoder),
            WireMessage::Unknown { payload, .. } => encoder.write_bytes(payload),
        }
        Ok(encoder.into_inner())
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, WireError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => WireMessage::Version(
                VersionMessage::decode_from(&mut decoder).map_err(malformed(command))?,
            ),
            "verack" => WireMessage::Verack,
            "ping" => WireMessage::Ping(decoder.read_fixed::<8>().map_err(malformed(command))?),
            "pong" => WireMessage::Pong(decoder.read_fixed::<8>().map_err(malformed(command))?),
            "getblocks" => WireMessage::GetBlocks(
                BlockLocatorRequest::decode_from(&mut decoder).map_err(malformed(command))?,
            ),
            "getheaders" => WireMessage::GetHeaders(
                BlockLocatorRequest::decode_from(&mut decoder).map_err(malformed(command))?,
            ),
            "headers" => WireMessage::Headers(decode_headers(&mut decoder).map_err(malformed(command))?),
            "inv" => WireMessage::Inv(decode_inventory(&mut decoder).map_err(malformed(command))?),
            "getdata" => {
                WireMessage::GetData(decode_inventory(&mut decoder).map_err(malformed(command))?)
            }
            "notfound" => {
                WireMessage::NotFound(decode_inventory(&mut decoder).map_err(malformed(command))?)
            }
            "block" => WireMessage::Block(Block::consensus_decode(&mut decoder).map_err(malformed(command))?),
            "tx" => WireMessage::Tx(Transaction::consensus_decode(&mut decoder).map_err(malformed(command))?),
            other => {
                return Ok(WireMessage::Unknown {
                    command: other.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        decoder.finish().map_err(malformed(command))?;
        Ok(message)
    }
}

fn decode_headers(decoder: &mut Decoder) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = decoder.read_count()?;
    if count > MAX_HEADERS_RESULTS {
        return Err(DecodeError::InvalidData("header count too large"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::consensus_decode(decoder)?);
        let _tx_count = decoder.read_varint()?;
    }
    Ok(headers)
}

fn decode_inventory(decoder: &mut Decoder) -> Result<Vec<Inventory>, DecodeError> {
    let count = decoder.read_count()?;
    if count > MAX_INV_ENTRIES {
        return Err(DecodeError::InvalidData("inv count too large"));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = InvKind::from_tag(decoder.read_u32_le()?);
        let hash = decoder.read_hash()?;
        items.push(Inventory { kind, hash });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_tag_follows_kind() {
        let payload = WireMessage::GetData(vec![Inventory::tx([1; 32]), Inventory::block([2; 32])])
            .encode_payload()
            .expect("encode");
        assert_eq!(payload[0], 2);
        assert_eq!(&payload[1..5], &MSG_TX.to_le_bytes());
        assert_eq!(&payload[37..41], &MSG_BLOCK.to_le_bytes());
    }

    #[test]
    fn locator_slices_must_be_hashes() {
        let good = [7u8; 32];
        let short = [7u8; 31];
        let request = BlockLocatorRequest::from_slices(70016, &[&good], &[0u8; 32]).expect("valid");
        assert_eq!(request.locator, vec![good]);
        let err = BlockLocatorRequest::from_slices(70016, &[&good, &short], &[0u8; 32])
            .expect_err("short hash");
        assert!(matches!(err, WireError::Schema(_)));
        assert!(BlockLocatorRequest::from_slices(70016, &[], &short).is_err());
    }

    #[test]
    fn oversized_locator_is_not_encoded() {
        let request = BlockLocatorRequest::new(1, vec![[0u8; 32]; MAX_LOCATOR_HASHES + 1]);
        let err = WireMessage::GetHeaders(request).encode_payload().expect_err("too many");
        assert!(matches!(err, WireError::Schema(_)));
    }

    #[test]
    fn version_without_relay_flag_decodes() {
        let message = VersionMessage {
            version: 70016,
            services: NODE_NETWORK,
            timestamp: 1_700_000_000,
            nonce: 9,
            user_agent: "/test:0.1/".to_string(),
            start_height: 812_000,
            relay: true,
        };
        let mut payload = WireMessage::Version(message.clone())
            .encode_payload()
            .expect("encode");
        payload.pop();
        let decoded = WireMessage::decode("version", &payload).expect("decode");
        assert_eq!(decoded, WireMessage::Version(message));
    }

    #[test]
    fn unknown_commands_pass_through() {
        let decoded = WireMessage::decode("sendcmpct", &[1, 2, 3]).expect("decode");
        assert_eq!(
            decoded,
            WireMessage::Unknown {
                command: "sendcmpct".to_string(),
                payload: vec![1, 2, 3]
            }
        );
    }
}
