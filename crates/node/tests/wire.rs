use chainidx::p2p::{frame, read_message, HEADER_SIZE};
use chainidx::wire::{
    BlockLocatorRequest, Inventory, VersionMessage, WireError, WireMessage, MAX_LOCATOR_HASHES,
};
use chainidx_params::Hash256;
use chainidx_primitives::{Block, BlockHeader, Encoder, OutPoint, Transaction, TxIn, TxOut};

const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

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

fn random_bytes(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_header(rng: &mut Lcg) -> BlockHeader {
    BlockHeader {
        version: rng.next_u32() as i32,
        prev_block: random_hash(rng),
        merkle_root: random_hash(rng),
        time: rng.next_u32(),
        bits: rng.next_u32(),
        nonce: rng.next_u32(),
    }
}

fn random_transaction(rng: &mut Lcg) -> Transaction {
    let vin = (0..1 + rng.gen_range(3))
        .map(|_| TxIn {
            prevout: OutPoint::new(random_hash(rng), rng.next_u32()),
            script_sig: random_bytes(rng, 40),
            sequence: rng.next_u32(),
            witness: Vec::new(),
        })
        .collect();
    let vout = (0..1 + rng.gen_range(3))
        .map(|_| TxOut {
            value: (rng.next_u64() >> 2) as i64,
            script_pubkey: random_bytes(rng, 34),
        })
        .collect();
    Transaction {
        version: 1 + rng.gen_range(2) as i32,
        vin,
        vout,
        lock_time: rng.next_u32(),
    }
}

fn random_inventory(rng: &mut Lcg) -> Vec<Inventory> {
    (0..rng.gen_range(6))
        .map(|_| {
            let hash = random_hash(rng);
            if rng.gen_range(2) == 0 {
                Inventory::tx(hash)
            } else {
                Inventory::block(hash)
            }
        })
        .collect()
}

fn random_locator(rng: &mut Lcg) -> BlockLocatorRequest {
    let hashes = (0..rng.gen_range(40)).map(|_| random_hash(rng)).collect();
    let mut request = BlockLocatorRequest::new(70016, hashes);
    if rng.gen_range(2) == 0 {
        request.stop = random_hash(rng);
    }
    request
}

fn random_message(rng: &mut Lcg) -> WireMessage {
    match rng.gen_range(12) {
        0 => WireMessage::Version(VersionMessage {
            version: 70016,
            services: rng.next_u64(),
            timestamp: (rng.next_u64() >> 1) as i64,
            nonce: rng.next_u64(),
            user_agent: format!("/agent:{}/", rng.next_u32()),
            start_height: (rng.next_u32() >> 1) as i32,
            relay: rng.gen_range(2) == 0,
        }),
        1 => WireMessage::Verack,
        2 => WireMessage::Ping(rng.next_u64().to_le_bytes()),
        3 => WireMessage::Pong(rng.next_u64().to_le_bytes()),
        4 => WireMessage::GetBlocks(random_locator(rng)),
        5 => WireMessage::GetHeaders(random_locator(rng)),
        6 => WireMessage::Headers((0..rng.gen_range(5)).map(|_| random_header(rng)).collect()),
        7 => WireMessage::Inv(random_inventory(rng)),
        8 => WireMessage::GetData(random_inventory(rng)),
        9 => WireMessage::NotFound(random_inventory(rng)),
        10 => WireMessage::Block(Block {
            header: random_header(rng),
            transactions: (0..1 + rng.gen_range(3))
                .map(|_| random_transaction(rng))
                .collect(),
        }),
        _ => WireMessage::Tx(random_transaction(rng)),
    }
}

#[test]
fn every_message_round_trips_and_rejects_trailing_bytes() {
    let mut rng = Lcg::new(0x5eed_0001);
    for _ in 0..500 {
        let message = random_message(&mut rng);
        let payload = message.encode_payload().expect("encode");
        let decoded = WireMessage::decode(message.command(), &payload).expect("decode");
        assert_eq!(decoded, message);

        let mut padded = payload.clone();
        padded.push(rng.next_u8());
        let err = WireMessage::decode(message.command(), &padded).expect_err("trailing byte");
        assert!(
            matches!(err, WireError::Decode { .. }),
            "{} accepted a trailing byte: {err}",
            message.command()
        );
    }
}

#[tokio::test]
async fn framed_messages_survive_the_reader() {
    let mut rng = Lcg::new(0x5eed_0002);
    let messages: Vec<WireMessage> = (0..50).map(|_| random_message(&mut rng)).collect();
    let mut stream = Vec::new();
    for message in &messages {
        stream.extend(frame(MAGIC, message).expect("frame"));
    }
    let mut reader = stream.as_slice();
    for message in &messages {
        let read = read_message(&mut reader, MAGIC).await.expect("read");
        assert_eq!(&read, message);
    }
    assert!(reader.is_empty());
}

#[test]
fn oversized_locator_is_truncated_on_decode() {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(70016);
    encoder.write_varint(10_000);
    for n in 0u32..10_000 {
        let mut hash = [0u8; 32];
        hash[..4].copy_from_slice(&n.to_le_bytes());
        encoder.write_hash(&hash);
    }
    encoder.write_hash(&[0xee; 32]);
    let payload = encoder.into_inner();

    let WireMessage::GetHeaders(request) =
        WireMessage::decode("getheaders", &payload).expect("decode")
    else {
        panic!("expected getheaders");
    };
    assert_eq!(request.locator.len(), MAX_LOCATOR_HASHES);
    assert_eq!(&request.locator[499][..4], &499u32.to_le_bytes());
    assert_eq!(request.stop, [0xee; 32]);
}

#[test]
fn truncated_payloads_are_errors() {
    let message = WireMessage::Inv(vec![Inventory::block([3; 32])]);
    let payload = message.encode_payload().expect("encode");
    for cut in 0..payload.len() {
        assert!(WireMessage::decode("inv", &payload[..cut]).is_err());
    }
    let framed = frame(MAGIC, &message).expect("frame");
    assert_eq!(framed.len(), HEADER_SIZE + payload.len());
}
