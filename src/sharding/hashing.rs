//! 64-bit hash functions for placing keys and virtual nodes on the ring.

use serde::{Deserialize, Serialize};

/// Seed used by the default MurmurHash64A variant.
pub const MURMUR_SEED: i32 = 0x1234_ABCD;

const MURMUR_M: u64 = 0xc6a4_a793_5bd1_e995;
const MURMUR_R: u32 = 47;

/// Maps a byte string to a signed 64-bit ring position.
pub trait KeyHasher {
    fn hash(&self, key: &[u8]) -> i64;
}

impl<F> KeyHasher for F
where
    F: Fn(&[u8]) -> i64,
{
    fn hash(&self, key: &[u8]) -> i64 {
        self(key)
    }
}

/// Built-in hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hashing {
    #[default]
    Murmur,
    Md5,
}

impl KeyHasher for Hashing {
    fn hash(&self, key: &[u8]) -> i64 {
        match self {
            Hashing::Murmur => murmur_hash64a(key, MURMUR_SEED),
            Hashing::Md5 => md5_hash(key),
        }
    }
}

/// MurmurHash64A over little-endian 8-byte blocks. A short tail is zero
/// padded to a full block.
pub fn murmur_hash64a(data: &[u8], seed: i32) -> i64 {
    // The seed is sign-extended before mixing.
    let mut h = (seed as i64 as u64) ^ (data.len() as u64).wrapping_mul(MURMUR_M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(block);
        k = k.wrapping_mul(MURMUR_M);
        k ^= k >> MURMUR_R;
        k = k.wrapping_mul(MURMUR_M);

        h ^= k;
        h = h.wrapping_mul(MURMUR_M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut block = [0u8; 8];
        block[..tail.len()].copy_from_slice(tail);
        h ^= u64::from_le_bytes(block);
        h = h.wrapping_mul(MURMUR_M);
    }

    h ^= h >> MURMUR_R;
    h = h.wrapping_mul(MURMUR_M);
    h ^= h >> MURMUR_R;
    h as i64
}

/// First four bytes of the MD5 digest read as a little-endian unsigned int.
/// Always non-negative.
pub fn md5_hash(data: &[u8]) -> i64 {
    let digest = md5::compute(data);
    i64::from(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
}
