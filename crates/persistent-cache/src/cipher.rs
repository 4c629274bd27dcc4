//! Encryption at rest
//!
//! The codec only sees the [`Cipher`] trait. [`KeyedCipher`] is the default
//! implementation: an HMAC-SHA256 counter-mode keystream under a random nonce,
//! followed by an HMAC-SHA256 tag over `nonce || ciphertext`.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AuthenticationError, CacheError, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 32;

/// Reversible keyed transform applied to record payloads.
pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;

    fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, AuthenticationError>;
}

/// Payload cipher keyed by a passphrase.
///
/// Each key is one unsalted SHA-256 over a fixed label and the passphrase.
/// There is no stretching, so a guessable passphrase is as weak as it looks:
/// pass a random secret of at least 128 bits, not a human password.
/// Derivation is deterministic, so any process given the same passphrase
/// opens the same records.
#[derive(Clone)]
pub struct KeyedCipher {
    keystream: HmacSha256,
    tag: HmacSha256,
}

impl KeyedCipher {
    /// Derive independent keystream and tag keys from a passphrase.
    /// See the type docs for the strength this requires of `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(CacheError::Config(
                "encryption key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            keystream: Self::derive(b"persistent-cache/keystream", passphrase)?,
            tag: Self::derive(b"persistent-cache/tag", passphrase)?,
        })
    }

    fn derive(label: &[u8], passphrase: &str) -> Result<HmacSha256> {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(passphrase.as_bytes());
        let key = hasher.finalize();
        HmacSha256::new_from_slice(&key).map_err(|e| CacheError::Config(e.to_string()))
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(BLOCK_LEN).enumerate() {
            let mut mac = self.keystream.clone();
            mac.update(nonce);
            mac.update(&(counter as u64).to_be_bytes());
            let block = mac.finalize().into_bytes();
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
    }

    fn tag_for(&self, nonce: &[u8], ciphertext: &[u8]) -> HmacSha256 {
        let mut mac = self.tag.clone();
        mac.update(nonce);
        mac.update(ciphertext);
        mac
    }
}

impl Cipher for KeyedCipher {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut ciphertext = plaintext.to_vec();
        self.apply_keystream(&nonce, &mut ciphertext);
        let tag = self.tag_for(&nonce, &ciphertext).finalize().into_bytes();

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag);
        sealed
    }

    fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, AuthenticationError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(AuthenticationError);
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        self.tag_for(nonce, ciphertext)
            .verify_slice(tag)
            .map_err(|_| AuthenticationError)?;

        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(nonce, &mut plaintext);
        Ok(plaintext)
    }
}

impl fmt::Debug for KeyedCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCipher").finish_non_exhaustive()
    }
}
