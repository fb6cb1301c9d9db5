//! Field-hash combiner shared by every writer and validator.
//!
//! Each field is hashed independently with 64-bit FNV-1a, shifted left by its
//! position in the field sequence and XOR-ed into the accumulator. The field
//! order is part of the persisted format: reordering fields changes every
//! stored hash.

use time::OffsetDateTime;
use ulid::Ulid;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Stable FNV-1a hash; platform-randomized hashers are unusable here.
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMixer {
    acc: u64,
    shift: u32,
}

impl Default for FieldMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldMixer {
    #[must_use]
    pub fn new() -> Self {
        Self { acc: 0, shift: 0 }
    }

    #[must_use]
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.acc ^= fnv1a64(bytes).wrapping_shl(self.shift);
        self.shift += 1;
        self
    }

    #[must_use]
    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    #[must_use]
    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    #[must_use]
    pub fn i64(self, value: i64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    #[must_use]
    pub fn ulid(self, value: Ulid) -> Self {
        self.bytes(&u128::from(value).to_le_bytes())
    }

    #[must_use]
    pub fn timestamp(self, value: OffsetDateTime) -> Self {
        self.bytes(&value.unix_timestamp_nanos().to_le_bytes())
    }

    /// Absent values still consume a position so later shifts stay stable.
    #[must_use]
    pub fn optional_ulid(self, value: Option<Ulid>) -> Self {
        match value {
            Some(id) => self.ulid(id),
            None => self.bytes(&[]),
        }
    }

    #[must_use]
    pub fn finish(self) -> u64 {
        self.acc
    }
}
