use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Rolling CRC-64 used to checksum mapping-log records.
pub struct Hasher {
    rolling_checksum: u64,
    crc64: Crc<u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("rolling_checksum", &self.rolling_checksum)
            .finish()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            rolling_checksum: 0,
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
        }
    }

    /// Folds a byte slice into the rolling checksum.
    pub fn write(&mut self, bytes: &[u8]) {
        self.rolling_checksum ^= self.crc64.checksum(bytes);
    }

    /// Returns the current rolling checksum.
    pub fn checksum(&self) -> u64 {
        self.rolling_checksum
    }

    /// Resets the rolling checksum to its initial state.
    pub fn reset(&mut self) {
        self.rolling_checksum = 0;
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let mut a = Hasher::new();
        a.write(b"mapping record");
        let mut b = Hasher::new();
        b.write(b"mapping record");
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), 0);
    }

    #[test]
    fn test_reset() {
        let mut hasher = Hasher::new();
        hasher.write(b"payload");
        let first = hasher.checksum();
        hasher.reset();
        assert_eq!(hasher.checksum(), 0);
        hasher.write(b"payload");
        assert_eq!(hasher.checksum(), first);
    }

    #[test]
    fn test_distinct_payloads_differ() {
        let mut a = Hasher::new();
        a.write(b"one");
        let mut b = Hasher::new();
        b.write(b"two");
        assert_ne!(a.checksum(), b.checksum());
    }
}
