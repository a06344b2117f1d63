//! AES-128-GCM with the nonce carried in front of the ciphertext:
//!
//! ```text
//! nonce (12) || ciphertext || tag (16)
//! ```
use super::Error;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 128-bit AES key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; KEY_LEN]);

/// Key protecting a credential's entries and access control profiles.
pub type StorageKey = AesKey;
/// Key protecting the credential keys at rest, normally held by secure hardware.
pub type HardwareBoundKey = AesKey;

impl AesKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// The well-known key test credentials are encrypted with.
    pub fn test_key() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("AES key must be 16 bytes"))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(self.0.as_slice().into())
    }
}

impl From<[u8; KEY_LEN]> for AesKey {
    fn from(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// Encrypt under a fresh random nonce.
pub fn encrypt(key: &AesKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(key: &AesKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Decryption);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Decryption)
}

/// Number of plaintext bytes a well-formed ciphertext of this length carries.
pub fn plaintext_len(ciphertext_len: usize) -> Option<usize> {
    ciphertext_len.checked_sub(NONCE_LEN + TAG_LEN)
}
