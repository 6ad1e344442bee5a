use std::str::FromStr;

use bytes::Bytes;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use cid::Version;

/// Multihash code of `sha2-256`.
pub const SHA2_256: u64 = 0x12;

/// Multicodec of a content block.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Codec(pub u64);

impl Codec {
    pub const RAW: Self = Self(0x55);
    pub const DAG_PB: Self = Self(0x70);
    pub const DAG_CBOR: Self = Self(0x71);
}

/// Content identifier.
///
/// Text form is multibase base16 lower (`f…`).
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Cid(cid::Cid);

impl Cid {
    /// Computes a `CIDv1` of the data with a `sha2-256` multihash.
    pub fn for_data(codec: Codec, data: &[u8]) -> Self {
        Self(cid::Cid::new_v1(codec.0, Code::Sha2_256.digest(data)))
    }

    pub fn version(&self) -> Version {
        self.0.version()
    }

    pub fn codec(&self) -> Codec {
        Codec(self.0.codec())
    }

    /// Multihash code of the digest.
    pub fn hash_code(&self) -> u64 {
        self.0.hash().code()
    }

    pub fn digest(&self) -> &[u8] {
        self.0.hash().digest()
    }

    pub fn prefix(&self) -> Prefix {
        let hash = self.0.hash();
        Prefix {
            version: self.0.version(),
            codec: self.codec(),
            hash_code: hash.code(),
            hash_len: u64::from(hash.size()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        cid::Cid::try_from(bytes).map(Self).map_err(CidError::from)
    }
}

impl From<cid::Cid> for Cid {
    #[inline]
    fn from(value: cid::Cid) -> Self {
        Self(value)
    }
}

impl From<Cid> for cid::Cid {
    #[inline]
    fn from(value: Cid) -> Self {
        value.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&multibase::encode(
            multibase::Base::Base16Lower,
            self.0.to_bytes(),
        ))
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = CidError;

    /// Accepts any multibase and the legacy base58 `Qm…` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        cid::Cid::try_from(s).map(Self).map_err(CidError::from)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
            s.parse().map_err(Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Cid::from_bytes(&bytes).map_err(Error::custom)
        }
    }
}

/// Everything of a [`Cid`] except the digest itself.
///
/// Sent along with block payloads so that the receiver can recompute the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub version: Version,
    pub codec: Codec,
    pub hash_code: u64,
    pub hash_len: u64,
}

impl Prefix {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(16);
        for value in [
            u64::from(self.version),
            self.codec.0,
            self.hash_code,
            self.hash_len,
        ] {
            let mut buffer = unsigned_varint::encode::u64_buffer();
            result.extend_from_slice(unsigned_varint::encode::u64(value, &mut buffer));
        }
        result
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (version, bytes) = unsigned_varint::decode::u64(bytes)?;
        let (codec, bytes) = unsigned_varint::decode::u64(bytes)?;
        let (hash_code, bytes) = unsigned_varint::decode::u64(bytes)?;
        let (hash_len, bytes) = unsigned_varint::decode::u64(bytes)?;
        if !bytes.is_empty() {
            return Err(CidError::TrailingBytes);
        }

        Ok(Self {
            version: Version::try_from(version)?,
            codec: Codec(codec),
            hash_code,
            hash_len,
        })
    }

    /// Hashes the data into a [`Cid`] with this prefix.
    pub fn sum(&self, data: &[u8]) -> Result<Cid, CidError> {
        let code =
            Code::try_from(self.hash_code).map_err(|_e| CidError::UnsupportedHash(self.hash_code))?;
        let hash = code.digest(data);
        if u64::from(hash.size()) != self.hash_len {
            return Err(CidError::UnsupportedHashLength(self.hash_len));
        }

        let cid = cid::Cid::new(self.version, self.codec.0, hash)?;
        Ok(Cid(cid))
    }
}

/// A content block with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    pub fn new(codec: Codec, data: Bytes) -> Self {
        Self {
            cid: Cid::for_data(codec, &data),
            data,
        }
    }

    /// Wraps data with a known id. The caller must guarantee that they match.
    pub fn new_unchecked(cid: Cid, data: Bytes) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CidError {
    #[error("invalid cid: {0}")]
    Invalid(#[from] cid::Error),
    #[error("invalid varint: {0}")]
    InvalidVarint(#[from] unsigned_varint::decode::Error),
    #[error("unsupported multihash code {0:#x}")]
    UnsupportedHash(u64),
    #[error("unsupported digest length {0}")]
    UnsupportedHashLength(u64),
    #[error("trailing bytes after prefix")]
    TrailingBytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_binary_and_text_forms() {
        let cid = Cid::for_data(Codec::RAW, b"hello");
        let bytes = cid.to_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x55, 0x12, 0x20]);
        assert_eq!(Cid::from_bytes(&bytes).unwrap(), cid);

        let text = cid.to_string();
        assert!(text.starts_with("f01551220"));
        assert_eq!(text.parse::<Cid>().unwrap(), cid);

        // Other multibases are accepted too.
        let base32 = cid::Cid::from(cid).to_string();
        assert!(base32.starts_with("bafk"));
        assert_eq!(base32.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn v0_is_bare_multihash() {
        let hash = Code::Sha2_256.digest(b"node");
        let cid = Cid::from(cid::Cid::new_v0(hash).unwrap());
        assert_eq!(cid.codec(), Codec::DAG_PB);

        let bytes = cid.to_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(Cid::from_bytes(&bytes).unwrap(), cid);
        assert_eq!(cid.prefix().sum(b"node").unwrap(), cid);
    }

    #[test]
    fn explicit_v0_form_is_rejected() {
        let mut bytes = vec![0x00, 0x55, 0x12, 0x20];
        bytes.extend_from_slice(&[7; 32]);
        assert!(Cid::from_bytes(&bytes).is_err());

        // A v0 prefix can only describe a `dag-pb` block.
        let prefix = Prefix {
            version: Version::V0,
            codec: Codec::RAW,
            hash_code: SHA2_256,
            hash_len: 32,
        };
        assert!(prefix.sum(b"data").is_err());
    }

    #[test]
    fn distinct_cids_have_distinct_text() {
        let data = b"same digest";
        let raw = Cid::for_data(Codec::RAW, data);
        let cbor = Cid::for_data(Codec::DAG_CBOR, data);
        assert_eq!(raw.digest(), cbor.digest());
        assert_ne!(raw, cbor);
        assert_ne!(raw.to_string(), cbor.to_string());

        for cid in [raw, cbor] {
            let decoded = Cid::from_bytes(&cid.to_bytes()).unwrap();
            assert_eq!(decoded.codec(), cid.codec());
            assert_eq!(decoded, cid);
        }
    }

    #[test]
    fn prefix_recomputes_cid() {
        let block = Block::new(Codec::DAG_CBOR, Bytes::from_static(b"some block"));
        let prefix = Prefix::from_bytes(&block.cid().prefix().to_bytes()).unwrap();
        assert_eq!(prefix, block.cid().prefix());
        assert_eq!(prefix.sum(block.data()).unwrap(), *block.cid());
        assert_ne!(prefix.sum(b"tampered").unwrap(), *block.cid());
    }

    #[test]
    fn prefix_rejects_unknown_hashes() {
        let mut prefix = Cid::for_data(Codec::RAW, b"x").prefix();
        prefix.hash_code = 0x7777;
        assert!(matches!(prefix.sum(b"x"), Err(CidError::UnsupportedHash(0x7777))));

        let mut prefix = Cid::for_data(Codec::RAW, b"x").prefix();
        prefix.hash_len = 20;
        assert!(matches!(prefix.sum(b"x"), Err(CidError::UnsupportedHashLength(20))));

        let mut bytes = Cid::for_data(Codec::RAW, b"x").prefix().to_bytes();
        bytes.push(0);
        assert!(matches!(Prefix::from_bytes(&bytes), Err(CidError::TrailingBytes)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cid::from_bytes(&[]).is_err());
        assert!(Cid::from_bytes(&[0x01, 0x55, 0x13, 0x20]).is_err());
        assert!(Cid::from_bytes(&[0xff; 12]).is_err());
        assert!("bafy".parse::<Cid>().is_err());
        assert!(Prefix::from_bytes(&[0xff]).is_err());
    }
}
