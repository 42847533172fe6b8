//! Node and superblock checksums.
//!
//! The on-disk format stores a 32-byte checksum slot at the front of every
//! node and of the superblock; the algorithm actually filling it is declared
//! once, in the superblock. Only the two algorithms we can verify are
//! supported; the other declared types are surfaced as decode errors by the
//! caller.

use crc::{Crc, CRC_32_ISCSI};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Width of the on-disk checksum slot. Unused tail bytes are zero.
pub const CSUM_SIZE: usize = 32;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum algorithm declared by the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc32c,
    XxHash64,
}

impl ChecksumKind {
    /// Map the superblock's raw type field. `None` for types we know of but
    /// cannot verify (SHA256, BLAKE2) and for garbage.
    pub fn from_raw(raw: u16) -> Option<ChecksumKind> {
        match raw {
            0 => Some(ChecksumKind::Crc32c),
            1 => Some(ChecksumKind::XxHash64),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ChecksumKind::Crc32c => 0,
            ChecksumKind::XxHash64 => 1,
        }
    }

    /// Bytes of one checksum item as stored in the checksum tree.
    pub fn digest_len(self) -> usize {
        match self {
            ChecksumKind::Crc32c => 4,
            ChecksumKind::XxHash64 => 8,
        }
    }

    /// Checksum `data` into a zero-padded slot.
    pub fn compute(self, data: &[u8]) -> [u8; CSUM_SIZE] {
        let mut out = [0u8; CSUM_SIZE];
        match self {
            ChecksumKind::Crc32c => {
                out[..4].copy_from_slice(&CASTAGNOLI.checksum(data).to_le_bytes());
            }
            ChecksumKind::XxHash64 => {
                let mut h = XxHash64::with_seed(0);
                h.write(data);
                out[..8].copy_from_slice(&h.finish().to_le_bytes());
            }
        }
        out
    }

    /// Verify a stored slot against `data`.
    pub fn verify(self, stored: &[u8], data: &[u8]) -> bool {
        stored.len() == CSUM_SIZE && stored == self.compute(data)
    }
}
