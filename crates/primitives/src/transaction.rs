//! UTXO-family transaction serialization (legacy layout, segwit-aware decode).

use chainidx_params::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    fn encode_base(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn decode_base(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Serialization without witness data; hashes to the txid.
    pub fn encode_legacy(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_base(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn txid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode_legacy(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    /// Full serialized size, witness included.
    pub fn size(&self) -> usize {
        crate::encoding::encode(self).len()
    }

    pub fn output_value(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        if !self.has_witness() {
            self.encode_legacy(encoder);
            return;
        }
        encoder.write_i32_le(self.version);
        encoder.write_u8(SEGWIT_MARKER);
        encoder.write_u8(SEGWIT_FLAG);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_base(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        for input in &self.vin {
            encoder.write_varint(input.witness.len() as u64);
            for item in &input.witness {
                encoder.write_var_bytes(item);
            }
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut input_count = decoder.read_count()?;
        let mut segwit = false;
        if input_count == 0 {
            // Zero inputs is the segwit marker; the next byte must be the flag.
            if decoder.read_u8()? != SEGWIT_FLAG {
                return Err(DecodeError::InvalidData("invalid segwit flag"));
            }
            segwit = true;
            input_count = decoder.read_count()?;
        }
        let mut vin = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            vin.push(TxIn::decode_base(decoder)?);
        }
        let output_count = decoder.read_count()?;
        let mut vout = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        if segwit {
            for input in &mut vin {
                let items = decoder.read_count()?;
                let mut witness = Vec::with_capacity(items.min(64));
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}
