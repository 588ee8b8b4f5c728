use sha2::{Digest, Sha256};

use super::codec::write_varint;
use super::model::{EventId, FINGERPRINT_SIZE, Fingerprint, ID_SIZE};

/// Incremental range fingerprint.
///
/// Ids are summed as 256-bit little-endian integers modulo 2^256, so the
/// result is independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    sum: [u8; ID_SIZE],
    count: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &EventId) {
        let mut carry = 0u16;
        for (acc, byte) in self.sum.iter_mut().zip(id.iter()) {
            let s = u16::from(*acc) + u16::from(*byte) + carry;
            *acc = s as u8;
            carry = s >> 8;
        }
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `SHA-256(sum || varint(count))[..16]`
    pub fn fingerprint(&self) -> Fingerprint {
        let mut to_hash = Vec::with_capacity(ID_SIZE + 10);
        to_hash.extend_from_slice(&self.sum);
        write_varint(&mut to_hash, self.count);

        let hash = Sha256::digest(&to_hash);
        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
        fingerprint
    }
}

impl<'a> Extend<&'a EventId> for Accumulator {
    fn extend<I: IntoIterator<Item = &'a EventId>>(&mut self, iter: I) {
        for id in iter {
            self.add(id);
        }
    }
}

/// Calculate the fingerprint for a set of event IDs
///
/// The fingerprint algorithm:
/// 1. Compute addition mod 2^256 of element IDs (as 32-byte little-endian unsigned integers)
/// 2. Concatenate with the number of elements, encoded as a varint
/// 3. Hash with SHA-256
/// 4. Take the first 16 bytes
pub fn calculate_fingerprint(ids: &[EventId]) -> Fingerprint {
    let mut acc = Accumulator::new();
    acc.extend(ids);
    acc.fingerprint()
}

/// Fingerprint of the empty set.
pub fn empty_fingerprint() -> Fingerprint {
    Accumulator::new().fingerprint()
}
