use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tl_proto::{TlPacket, TlRead, TlResult, TlWrite};
use tycho_crypto::ed25519;

/// Peer identity, an `ed25519` public key.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn wrap(bytes: &[u8; 32]) -> &Self {
        // SAFETY: `[u8; 32]` has the same layout as `PeerId`.
        unsafe { &*(bytes as *const [u8; 32]).cast::<Self>() }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn as_public_key(&self) -> Option<ed25519::PublicKey> {
        ed25519::PublicKey::from_bytes(self.0)
    }

    /// Random id which is not guaranteed to be a valid public key.
    pub fn random() -> Self {
        Self(rand::rng().random())
    }
}

impl From<ed25519::PublicKey> for PeerId {
    #[inline]
    fn from(public_key: ed25519::PublicKey) -> Self {
        Self(public_key.to_bytes())
    }
}

impl From<&ed25519::PublicKey> for PeerId {
    #[inline]
    fn from(public_key: &ed25519::PublicKey) -> Self {
        Self(public_key.to_bytes())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(32);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({self:.4})")
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut peer_id = PeerId([0; 32]);
        hex::decode_to_slice(s, &mut peer_id.0).map(|_| peer_id)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
            s.parse().map_err(Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

impl TlWrite for PeerId {
    type Repr = tl_proto::Bare;

    #[inline]
    fn max_size_hint(&self) -> usize {
        32
    }

    #[inline]
    fn write_to<P: TlPacket>(&self, packet: &mut P) {
        packet.write_raw_slice(&self.0);
    }
}

impl<'tl> TlRead<'tl> for PeerId {
    type Repr = tl_proto::Bare;

    #[inline]
    fn read_from(packet: &mut &'tl [u8]) -> TlResult<Self> {
        <[u8; 32]>::read_from(packet).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_round_trip() {
        let peer_id = PeerId::random();
        let parsed = peer_id.to_string().parse::<PeerId>().unwrap();
        assert_eq!(parsed, peer_id);

        let json = serde_json::to_string(&peer_id).unwrap();
        assert_eq!(json, format!("\"{peer_id}\""));
    }

    #[test]
    fn short_debug_form() {
        let peer_id = PeerId([0xab; 32]);
        assert_eq!(format!("{peer_id:?}"), "PeerId(abababab)");
    }
}
