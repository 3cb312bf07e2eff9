// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ByteOrder};

/// Size of a record name in bytes (256 bits).
pub const RECORD_NAME_SIZE: usize = 32;

/// An opaque 256-bit content fingerprint.
///
/// Three slices are carved out of fixed byte offsets and used by different
/// subsystems: [`RecordName::volume_index_bytes`] shards the volume index,
/// [`RecordName::chapter_index_bytes`] shards a chapter's delta index, and
/// [`RecordName::sample_bytes`] decides sparse-mode sampling.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

impl RecordName {
    #[must_use]
    pub fn new(bytes: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; RECORD_NAME_SIZE] {
        &self.0
    }

    /// Bytes `0..8`, big-endian: used to shard the volume index.
    #[must_use]
    pub fn volume_index_bytes(&self) -> u64 {
        BigEndian::read_u64(&self.0[0..8])
    }

    /// Bytes `8..14`: used to shard a chapter's delta index.
    ///
    /// Widened into a `u64` (big-endian, left-padded with zero bytes) so
    /// callers can treat it uniformly; only the low 48 bits carry data.
    #[must_use]
    pub fn chapter_index_bytes(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[8..14]);
        BigEndian::read_u64(&buf)
    }

    /// Bytes `14..16`: used for sparse-mode sampling.
    #[must_use]
    pub fn sample_bytes(&self) -> u16 {
        BigEndian::read_u16(&self.0[14..16])
    }
}

impl std::fmt::Debug for RecordName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordName(")?;
        for byte in &self.0[0..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl From<[u8; RECORD_NAME_SIZE]> for RecordName {
    fn from(value: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn name_from(pattern: &[u8]) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        for (i, b) in pattern.iter().cycle().take(RECORD_NAME_SIZE).enumerate() {
            bytes[i] = *b;
        }
        RecordName::new(bytes)
    }

    #[test]
    fn slices_use_fixed_offsets() {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        bytes[8..14].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        bytes[14..16].copy_from_slice(&0x1234u16.to_be_bytes());

        let name = RecordName::new(bytes);

        assert_eq!(name.volume_index_bytes(), 0x0102_0304_0506_0708);
        assert_eq!(name.chapter_index_bytes(), 0x0000_1122_3344_5566);
        assert_eq!(name.sample_bytes(), 0x1234);
    }

    #[test]
    fn distinct_patterns_produce_distinct_shards() {
        let a = name_from(&[1, 2, 3, 4]);
        let b = name_from(&[9, 8, 7, 6]);
        assert_ne!(a.volume_index_bytes(), b.volume_index_bytes());
    }
}
