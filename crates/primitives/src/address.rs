//! Output script to address rendering for UTXO chains.

use bech32::Hrp;
use chainidx_params::AddressPrefixes;

/// Renders the address an output pays to, or `None` for nonstandard scripts.
pub fn script_to_address(script: &[u8], prefixes: &AddressPrefixes) -> Option<String> {
    if is_p2pkh(script) {
        return Some(base58check(prefixes.pubkey_hash, &script[3..23]));
    }
    if is_p2sh(script) {
        return Some(base58check(prefixes.script_hash, &script[2..22]));
    }
    let hrp = prefixes.bech32_hrp?;
    let (version, program) = witness_program(script)?;
    let hrp = Hrp::parse(hrp).ok()?;
    match version {
        0 => bech32::segwit::encode_v0(hrp, program).ok(),
        1 => bech32::segwit::encode_v1(hrp, program).ok(),
        _ => None,
    }
}

fn base58check(prefix: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(prefix);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xa9
        && script[2] == 0x14
        && script[23] == 0x88
        && script[24] == 0xac
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == 0xa9 && script[1] == 0x14 && script[22] == 0x87
}

fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        0x00 => 0,
        op @ 0x51..=0x60 => op - 0x50,
        _ => return None,
    };
    let len = usize::from(script[1]);
    if len + 2 != script.len() {
        return None;
    }
    let program = &script[2..];
    match (version, program.len()) {
        (0, 20) | (0, 32) | (1, 32) => Some((version, program)),
        _ => None,
    }
}
