use chainidx_params::Hash256;
use chainidx_primitives::block::{Block, BlockHeader};
use chainidx_primitives::encoding::{decode, encode, DecodeError, Decoder, Encoder};
use chainidx_primitives::outpoint::OutPoint;
use chainidx_primitives::transaction::{Transaction, TxIn, TxOut};

const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u8(&mut self) -> u8 {
        (self.next_u64() >> 56) as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_vec(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_transaction(rng: &mut Lcg) -> Transaction {
    let segwit = rng.gen_range(2) == 1;
    // At least one input: an empty input list is indistinguishable from the segwit marker.
    let vin = (0..1 + rng.gen_range(3))
        .map(|_| TxIn {
            prevout: OutPoint::new(random_hash(rng), rng.next_u32()),
            script_sig: random_vec(rng, 16),
            sequence: rng.next_u32(),
            witness: if segwit {
                (0..1 + rng.gen_range(2)).map(|_| random_vec(rng, 8)).collect()
            } else {
                Vec::new()
            },
        })
        .collect();
    let vout = (0..rng.gen_range(4))
        .map(|_| TxOut {
            value: i64::from(rng.next_u32()),
            script_pubkey: random_vec(rng, 25),
        })
        .collect();
    Transaction {
        version: 1 + rng.gen_range(2) as i32,
        vin,
        vout,
        lock_time: rng.next_u32(),
    }
}

fn random_block(rng: &mut Lcg) -> Block {
    let transactions: Vec<Transaction> = (0..1 + rng.gen_range(3))
        .map(|_| random_transaction(rng))
        .collect();
    let mut block = Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_block: random_hash(rng),
            merkle_root: [0u8; 32],
            time: rng.next_u32(),
            bits: rng.next_u32(),
            nonce: rng.next_u32(),
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().unwrap_or_default();
    block
}

#[test]
fn compactsize_roundtrip_random() {
    let mut rng = Lcg::new(0x5eed);
    for _ in 0..1_000 {
        let value = rng.next_u64() % MAX_COMPACT_SIZE;
        let mut encoder = Encoder::new();
        encoder.write_varint(value);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = decoder.read_varint().expect("decode compactsize");
        assert_eq!(decoded, value);
        assert!(decoder.is_empty());
    }
}

#[test]
fn compactsize_rejects_noncanonical() {
    let cases = [
        vec![0xfd, 0xfc, 0x00],
        vec![0xfe, 0xff, 0x00, 0x00, 0x00],
        vec![0xff, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    for bytes in cases {
        let mut decoder = Decoder::new(&bytes);
        let err = decoder.read_varint().expect_err("noncanonical compactsize");
        assert_eq!(err, DecodeError::NonCanonicalVarInt);
    }
}

#[test]
fn randomized_transaction_roundtrip() {
    let mut rng = Lcg::new(0x1234_5678);
    for _ in 0..200 {
        let tx = random_transaction(&mut rng);
        let decoded: Transaction = decode(&encode(&tx)).expect("decode random tx");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }
}

#[test]
fn randomized_block_roundtrip_keeps_merkle_root() {
    let mut rng = Lcg::new(0xb10c);
    for _ in 0..50 {
        let block = random_block(&mut rng);
        let decoded: Block = decode(&encode(&block)).expect("decode random block");
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(
            decoded.compute_merkle_root(),
            Some(block.header.merkle_root)
        );
    }
}

#[test]
fn truncated_transactions_fail_cleanly() {
    let mut rng = Lcg::new(0xdead);
    for _ in 0..100 {
        let bytes = encode(&random_transaction(&mut rng));
        let cut = rng.gen_range(bytes.len());
        assert!(decode::<Transaction>(&bytes[..cut]).is_err());
    }
}
