//! Record codec
//!
//! Layout of a stored blob:
//!
//! ```text
//! b"PCR1" | header length (u32, big endian) | JSON header | payload
//! ```
//!
//! The header (key, group, creation time, TTL, encrypted flag) is always
//! plaintext so expiry can be decided without the encryption key. Only the
//! payload goes through the [`Cipher`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::Cipher;
use crate::error::{CacheError, DecodeError, Result};
use crate::types::CacheRecord;

const MAGIC: &[u8; 4] = b"PCR1";
const PREFIX_LEN: usize = MAGIC.len() + 4;

/// Plaintext metadata stored in front of every payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: String,
    pub group: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub encrypted: bool,
}

#[derive(Clone, Default)]
pub struct RecordCodec {
    cipher: Option<Arc<dyn Cipher>>,
}

impl RecordCodec {
    pub fn new(cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self { cipher }
    }

    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn can_encrypt(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode a record. Fails with [`CacheError::MissingEncryptionKey`] when
    /// the record asks for encryption and no cipher is configured.
    pub fn encode(&self, record: &CacheRecord) -> Result<Vec<u8>> {
        let payload = if record.encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or(CacheError::MissingEncryptionKey)?;
            cipher.seal(&record.payload)
        } else {
            record.payload.clone()
        };

        let header = serde_json::to_vec(&RecordHeader {
            key: record.key.clone(),
            group: record.group.clone(),
            created_at: record.created_at,
            ttl: record.ttl,
            encrypted: record.encrypted,
        })?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| CacheError::Serialization("record header too large".to_string()))?;

        let mut out = Vec::with_capacity(PREFIX_LEN + header.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<CacheRecord, DecodeError> {
        let (header, body) = split(bytes)?;

        let payload = if header.encrypted {
            let cipher = self.cipher.as_ref().ok_or(DecodeError::MissingKey)?;
            cipher.open(body)?
        } else {
            body.to_vec()
        };

        Ok(CacheRecord {
            key: header.key,
            group: header.group,
            created_at: header.created_at,
            ttl: header.ttl,
            encrypted: header.encrypted,
            payload,
        })
    }

    /// Decode only the metadata; never touches the cipher.
    pub fn decode_header(&self, bytes: &[u8]) -> std::result::Result<RecordHeader, DecodeError> {
        split(bytes).map(|(header, _)| header)
    }
}

fn split(bytes: &[u8]) -> std::result::Result<(RecordHeader, &[u8]), DecodeError> {
    if bytes.len() < PREFIX_LEN {
        return Err(DecodeError::Corrupt(format!(
            "record is {} bytes, shorter than its prefix",
            bytes.len()
        )));
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(DecodeError::Corrupt("bad magic".to_string()));
    }
    let (len, rest) = rest.split_at(4);
    let header_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < header_len {
        return Err(DecodeError::Corrupt(format!(
            "header declares {} bytes, {} available",
            header_len,
            rest.len()
        )));
    }
    let (header, payload) = rest.split_at(header_len);
    let header: RecordHeader = serde_json::from_slice(header)
        .map_err(|e| DecodeError::Corrupt(format!("header: {}", e)))?;
    Ok((header, payload))
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("encrypts", &self.can_encrypt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KeyedCipher;
    use crate::key::RecordKey;
    use proptest::prelude::*;

    fn keyed(passphrase: &str) -> RecordCodec {
        RecordCodec::new(Some(Arc::new(
            KeyedCipher::from_passphrase(passphrase).unwrap(),
        )))
    }

    fn sample(encrypted: bool) -> CacheRecord {
        CacheRecord::new(
            &RecordKey::new("GROUP", "1700000000000"),
            b"[{\"message\":\"mock\"}]".to_vec(),
            Utc::now(),
        )
        .with_ttl(Some(Duration::from_millis(1)))
        .encrypted(encrypted)
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let codec = RecordCodec::plaintext();
        let record = sample(false);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_encrypted_payload_hidden_but_header_readable() {
        let codec = keyed("myStrongKey-1234");
        let record = sample(true);
        let bytes = codec.encode(&record).unwrap();

        let needle = b"mock";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));

        let header = RecordCodec::plaintext().decode_header(&bytes).unwrap();
        assert!(header.encrypted);
        assert_eq!(header.group, "GROUP");
        assert_eq!(header.ttl, Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_encrypt_without_cipher_is_rejected() {
        let err = RecordCodec::plaintext().encode(&sample(true)).unwrap_err();
        assert!(matches!(err, CacheError::MissingEncryptionKey));
    }

    #[test]
    fn test_missing_key_on_decode() {
        let bytes = keyed("k").encode(&sample(true)).unwrap();
        assert_eq!(
            RecordCodec::plaintext().decode(&bytes),
            Err(DecodeError::MissingKey)
        );
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let bytes = keyed("right").encode(&sample(true)).unwrap();
        assert!(matches!(
            keyed("wrong").decode(&bytes),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unencrypted_record_readable_with_cipher() {
        let record = sample(false);
        let bytes = RecordCodec::plaintext().encode(&record).unwrap();
        assert_eq!(keyed("k").decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_malformed_inputs_are_corrupt() {
        let codec = RecordCodec::plaintext();
        let good = codec.encode(&sample(false)).unwrap();

        for bad in [
            Vec::new(),
            b"PCR".to_vec(),
            b"XXXX\0\0\0\0".to_vec(),
            good[..PREFIX_LEN + 3].to_vec(),
            [MAGIC.as_slice(), &[0u8, 0, 0, 2][..], &b"{}"[..]].concat(),
        ] {
            assert!(
                matches!(codec.decode(&bad), Err(DecodeError::Corrupt(_))),
                "expected corrupt for {:?}",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip_with_encryption(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            passphrase in "[a-zA-Z0-9]{1,32}",
            key in "\\PC{0,24}",
            group in "\\PC{0,12}",
            ttl_ms in proptest::option::of(0u64..86_400_000),
        ) {
            let codec = keyed(&passphrase);
            let record = CacheRecord {
                key,
                group,
                created_at: Utc::now(),
                ttl: ttl_ms.map(Duration::from_millis),
                encrypted: true,
                payload,
            };
            let bytes = codec.encode(&record).unwrap();
            prop_assert_eq!(codec.decode(&bytes).unwrap(), record);

            let other = keyed(&format!("{}-other", passphrase));
            prop_assert!(other.decode(&bytes).is_err());
            prop_assert_eq!(RecordCodec::plaintext().decode(&bytes), Err(DecodeError::MissingKey));
        }
    }
}
