use crate::Hash256;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("invalid hash length")]
    InvalidLength,
    #[error("invalid hex character")]
    InvalidHex,
}

/// Parses a display-order (byte reversed) hash, as printed by explorers and node RPCs.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut raw = input.trim();
    if let Some(stripped) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        raw = stripped;
    }
    if raw.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(raw, &mut bytes).map_err(|_| HexError::InvalidHex)?;
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Account chains print hashes in natural byte order with a `0x` prefix.
pub fn hash256_from_prefixed_hex(input: &str) -> Result<Hash256, HexError> {
    let raw = input
        .trim()
        .strip_prefix("0x")
        .ok_or(HexError::InvalidHex)?;
    if raw.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(raw, &mut bytes).map_err(|_| HexError::InvalidHex)?;
    Ok(bytes)
}

pub fn hash256_to_prefixed_hex(hash: &Hash256) -> String {
    format!("0x{}", hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_order_is_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let text = hash256_to_hex(&hash);
        assert!(text.ends_with("ab"));
        assert_eq!(hash256_from_hex(&text), Ok(hash));
        assert_eq!(hash256_from_hex(&format!("0x{text}")), Ok(hash));
    }

    #[test]
    fn rejects_short_and_bad_input() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex(&"zz".repeat(32)), Err(HexError::InvalidHex));
        assert!(hash256_from_prefixed_hex(&"00".repeat(32)).is_err());
    }
}
