//! Helper module to compute a CRC32 checksum

use crc32fast::Hasher;

/// Rolling CRC-32 (IEEE 802.3) accumulator.
///
/// Feeding the same bytes through any partition of `append` calls yields
/// the same final value.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Crc32 {
        Crc32 {
            hasher: Hasher::new(),
        }
    }

    /// Folds `bytes` into the running value.
    pub fn append(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Returns the finalised 32-bit value.
    pub fn get(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl std::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Crc32({:#010x})", self.get())
    }
}
