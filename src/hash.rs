//! Stable non-cryptographic hashing for cache keys and manifest digests.

/// FNV-1a 64-bit hash, stable across Rust versions and platforms.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 16-character lowercase hex digest of `data`.
pub fn hex_digest(data: &[u8]) -> String {
    format!("{:016x}", fnv1a_64(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_hex_digest_width() {
        assert_eq!(hex_digest(b"").len(), 16);
        assert_ne!(hex_digest(b"torch"), hex_digest(b"torchvision"));
    }
}
