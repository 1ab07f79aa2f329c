use std::io::Cursor;

use murmur3::murmur3_x64_128;

const HASH_SEED: u32 = 0x19264330;

/// deterministic 64-bit digest, stable across processes and runs
pub fn hash64(v: &[u8]) -> u64 {
    let mut cursor = Cursor::new(v);
    let h = murmur3_x64_128(&mut cursor, HASH_SEED).expect("murmur3 over in-memory buffer");
    h as u64
}

#[cfg(test)]
mod tests {
    use crate::utils::hash::hash64;

    #[test]
    pub fn hash64_stable_test() {
        assert_eq!(hash64(b"machine-0"), hash64(b"machine-0"));
        assert_ne!(hash64(b"machine-0"), hash64(b"machine-1"));
    }
}
