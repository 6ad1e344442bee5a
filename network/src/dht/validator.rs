use bytes::Bytes;
use cairn_util::time::now_sec;
use tycho_crypto::ed25519;

use crate::proto::dht::{SignedValue, SignedValueToSign};
use crate::types::PeerId;

/// Namespace of self-certified records.
pub const IPNS_NAMESPACE: &[u8] = b"/ipns/";

/// Record checks shared by the DHT client and server.
pub trait RecordValidator: Send + Sync + 'static {
    /// Checks that the value is acceptable for the key.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), RecordError>;

    /// Returns the index of the best of the values.
    ///
    /// Earlier values win ties.
    fn select(&self, key: &[u8], values: &[&[u8]]) -> Result<usize, RecordError>;
}

/// Validates `/ipns/<owner>` records with [`SignedValue`] payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignedRecordValidator;

impl SignedRecordValidator {
    fn parse(&self, key: &[u8], value: &[u8]) -> Result<SignedValue, RecordError> {
        let Some(owner) = key.strip_prefix(IPNS_NAMESPACE) else {
            return Err(RecordError::UnknownNamespace);
        };

        let value = tl_proto::deserialize::<SignedValue>(value)?;
        if owner != value.owner.as_bytes() {
            return Err(RecordError::KeyMismatch);
        }
        Ok(value)
    }
}

impl RecordValidator for SignedRecordValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), RecordError> {
        let value = self.parse(key, value)?;

        if value.expires_at <= now_sec() {
            return Err(RecordError::Expired);
        }

        let Some(public_key) = value.owner.as_public_key() else {
            return Err(RecordError::InvalidSignature);
        };
        let Ok::<&[u8; 64], _>(signature) = value.signature.as_ref().try_into() else {
            return Err(RecordError::InvalidSignature);
        };

        let to_sign = SignedValueToSign {
            owner: &value.owner,
            seq: value.seq,
            expires_at: value.expires_at,
            data: &value.data,
        };
        if !public_key.verify_tl(to_sign, signature) {
            return Err(RecordError::InvalidSignature);
        }

        Ok(())
    }

    fn select(&self, key: &[u8], values: &[&[u8]]) -> Result<usize, RecordError> {
        let mut best: Option<(usize, u64)> = None;
        for (i, value) in values.iter().enumerate() {
            let Ok(value) = self.parse(key, value) else {
                continue;
            };
            match best {
                Some((_, seq)) if seq >= value.seq => {}
                _ => best = Some((i, value.seq)),
            }
        }

        best.map(|(i, _)| i).ok_or(RecordError::NoValidValues)
    }
}

/// Returns the DHT key of the records owned by the peer.
pub fn ipns_key(owner: &PeerId) -> Bytes {
    let mut key = Vec::with_capacity(IPNS_NAMESPACE.len() + 32);
    key.extend_from_slice(IPNS_NAMESPACE);
    key.extend_from_slice(owner.as_bytes());
    key.into()
}

impl SignedValue {
    /// Builds a value signed by the keypair owner.
    pub fn new_signed(keypair: &ed25519::KeyPair, seq: u64, expires_at: u32, data: Bytes) -> Self {
        let owner = PeerId::from(keypair.public_key);
        let signature = keypair.sign_tl(SignedValueToSign {
            owner: &owner,
            seq,
            expires_at,
            data: &data,
        });

        Self {
            owner,
            seq,
            expires_at,
            data,
            signature: Bytes::copy_from_slice(&signature),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("unknown record namespace")]
    UnknownNamespace,
    #[error("record key does not match its owner")]
    KeyMismatch,
    #[error("record expired")]
    Expired,
    #[error("invalid record signature")]
    InvalidSignature,
    #[error("record is too large")]
    TooLarge,
    #[error("no valid values to select from")]
    NoValidValues,
    #[error("invalid record value: {0}")]
    InvalidValue(#[from] tl_proto::TlError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ed25519::KeyPair {
        ed25519::KeyPair::from(&ed25519::SecretKey::from_bytes(rand::random()))
    }

    fn record(keypair: &ed25519::KeyPair, seq: u64) -> Vec<u8> {
        let value = SignedValue::new_signed(
            keypair,
            seq,
            now_sec() + 60,
            Bytes::from_static(b"/ipfs/some-path"),
        );
        tl_proto::serialize(value)
    }

    #[test]
    fn signed_records_are_validated() {
        let keypair = keypair();
        let key = ipns_key(&PeerId::from(keypair.public_key));
        let value = record(&keypair, 1);

        let validator = SignedRecordValidator;
        validator.validate(&key, &value).unwrap();

        // Wrong owner
        let other_key = ipns_key(&PeerId::random());
        assert!(matches!(
            validator.validate(&other_key, &value),
            Err(RecordError::KeyMismatch)
        ));

        // Wrong namespace
        assert!(matches!(
            validator.validate(b"/pk/abc", &value),
            Err(RecordError::UnknownNamespace)
        ));

        // Tampered data
        let mut parsed = tl_proto::deserialize::<SignedValue>(&value).unwrap();
        parsed.data = Bytes::from_static(b"/ipfs/other-path");
        let tampered = tl_proto::serialize(parsed);
        assert!(matches!(
            validator.validate(&key, &tampered),
            Err(RecordError::InvalidSignature)
        ));
    }

    #[test]
    fn newer_sequence_wins() {
        let keypair = keypair();
        let key = ipns_key(&PeerId::from(keypair.public_key));

        let old = record(&keypair, 1);
        let new = record(&keypair, 2);
        let same = record(&keypair, 2);

        let validator = SignedRecordValidator;
        assert_eq!(validator.select(&key, &[&old, &new]).unwrap(), 1);
        assert_eq!(validator.select(&key, &[&new, &old]).unwrap(), 0);
        assert_eq!(validator.select(&key, &[&new, &same]).unwrap(), 0);
    }
}
