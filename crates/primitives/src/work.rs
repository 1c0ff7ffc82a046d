//! Proof-of-work accounting for fork choice. Targets are not validated here.

use primitive_types::U256;

/// Expands a compact `bits` target. `None` for negative or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return None;
    }
    if size <= 3 {
        word >>= 8 * (3 - size);
        Some(U256::from(word))
    } else {
        Some(U256::from(word) << (8 * (size - 3) as usize))
    }
}

/// Expected number of hashes for a block at `bits`: `2^256 / (target + 1)`.
pub fn block_work(bits: u32) -> U256 {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

pub fn work_to_bytes(work: U256) -> [u8; 32] {
    work.to_big_endian()
}

pub fn work_from_bytes(bytes: &[u8; 32]) -> U256 {
    U256::from_big_endian(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_one_work() {
        // 0x1d00ffff is difficulty 1: 2^32 + 2^16 + ... hashes on average.
        assert_eq!(block_work(0x1d00_ffff), U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn invalid_compact_has_no_work() {
        assert_eq!(block_work(0x0480_0000), U256::zero());
        assert_eq!(block_work(0xff12_3456), U256::zero());
        assert_eq!(block_work(0), U256::zero());
    }

    #[test]
    fn bytes_round_trip() {
        let work = block_work(0x207f_ffff) * U256::from(10u8);
        assert_eq!(work_from_bytes(&work_to_bytes(work)), work);
    }
}
