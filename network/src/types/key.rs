use sha2::{Digest, Sha256};

use crate::types::PeerId;

/// Number of bits in the DHT key space.
pub const KEY_BITS: usize = 256;

/// A point in the DHT key space.
///
/// Both peers and arbitrary keys are mapped into it with `sha256`.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct Key([u8; 32]);

impl Key {
    pub fn from_raw(key: &[u8]) -> Self {
        Self(Sha256::digest(key).into())
    }

    pub fn from_peer_id(peer_id: &PeerId) -> Self {
        Self::from_raw(peer_id.as_bytes())
    }

    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn distance(&self, other: &Self) -> Distance {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.distance(other).leading_zeros()
    }
}

impl From<&PeerId> for Key {
    #[inline]
    fn from(peer_id: &PeerId) -> Self {
        Self::from_peer_id(peer_id)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(32);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self:.4})")
    }
}

/// XOR distance between two keys, ordered as a big-endian integer.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Distance([u8; 32]);

impl Distance {
    pub const ZERO: Self = Self([0; 32]);
    pub const MAX: Self = Self([0xff; 32]);

    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    pub fn leading_zeros(&self) -> usize {
        let mut result = 0;
        for byte in self.0 {
            if byte == 0 {
                result += 8;
            } else {
                return result + byte.leading_zeros() as usize;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_a_metric() {
        for _ in 0..32 {
            let a = Key::from_peer_id(&PeerId::random());
            let b = Key::from_peer_id(&PeerId::random());

            assert!(a.distance(&a).is_zero());
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&b) > Distance::ZERO);
        }
    }

    #[test]
    fn common_prefix_len() {
        let a = Key::from_hash([0; 32]);
        assert_eq!(a.common_prefix_len(&a), KEY_BITS);

        let mut bytes = [0; 32];
        bytes[0] = 0b1000_0000;
        assert_eq!(a.common_prefix_len(&Key::from_hash(bytes)), 0);

        bytes[0] = 0b0000_0001;
        assert_eq!(a.common_prefix_len(&Key::from_hash(bytes)), 7);

        let mut bytes = [0; 32];
        bytes[31] = 1;
        assert_eq!(a.common_prefix_len(&Key::from_hash(bytes)), 255);
    }

    #[test]
    fn distance_order_matches_integer_order() {
        let target = Key::from_hash([0; 32]);
        let mut near = [0; 32];
        near[1] = 0xff;
        let mut far = [0; 32];
        far[0] = 0x01;

        let near = target.distance(&Key::from_hash(near));
        let far = target.distance(&Key::from_hash(far));
        assert!(near < far);
    }
}
