//! The XOR keyspace.
//!
//! Node identifiers and topics share one 32-byte keyspace so that
//! announcements land on the nodes whose identifiers are closest to the
//! topic.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use keel_base::{PublicKey, Topic};

/// A 32-byte identifier in the overlay keyspace: a node's public key or
/// a discovery topic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Id(pub [u8; 32]);

impl Id {
    /// Create an identifier from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Id(bytes)
    }

    /// The underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &Id) -> Distance {
        Distance::between(&self.0, &other.0)
    }
}

impl From<PublicKey> for Id {
    fn from(key: PublicKey) -> Self {
        Id(*key.as_bytes())
    }
}

impl From<Topic> for Id {
    fn from(topic: Topic) -> Self {
        Id(*topic.as_bytes())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// XOR distance between two identifiers. Orders big-endian, most
/// significant byte first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Zero distance, i.e. the same identifier.
    pub const ZERO: Self = Self([0; 32]);
    /// Maximum possible distance.
    pub const MAX: Self = Self([0xFF; 32]);

    /// XOR of two identifiers.
    pub fn between(a: &[u8; 32], b: &[u8; 32]) -> Self {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a[i] ^ b[i];
        }
        Self(out)
    }

    /// The bucket index for this distance: the number of leading zero
    /// bits, 0 (furthest) to 255 (closest). `None` for zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        let zeros = self.leading_zeros();
        if zeros >= 256 {
            None
        } else {
            Some(zeros)
        }
    }

    fn leading_zeros(&self) -> usize {
        for (byte_idx, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        256
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> Id {
        Id::new([seed; 32])
    }

    #[test]
    fn test_distance_symmetric() {
        let a = id(1);
        let b = id(2);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = id(42);
        assert_eq!(a.distance(&a), Distance::ZERO);
        assert_eq!(a.distance(&a).bucket_index(), None);
    }

    #[test]
    fn test_bucket_index_by_first_differing_bit() {
        let zero = id(0);
        for bit in 0..8 {
            let mut bytes = [0u8; 32];
            bytes[0] = 1 << (7 - bit);
            let other = Id::new(bytes);
            assert_eq!(zero.distance(&other).bucket_index(), Some(bit));
        }
        let mut bytes = [0u8; 32];
        bytes[31] = 0x01;
        assert_eq!(zero.distance(&Id::new(bytes)).bucket_index(), Some(255));
    }

    #[test]
    fn test_distance_ordering() {
        let target = id(0);
        let close = id(0x01);
        let far = id(0xFF);
        assert!(target.distance(&close) < target.distance(&far));
        assert_eq!(target.distance(&far), Distance::MAX);
    }
}
