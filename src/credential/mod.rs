//! The persisted credential and the keys protecting it.
//!
//! [store] decrypts and parses credential data into a read-only [CredentialRecord].
//! [personalization] writes the same format and is the only way this crate produces it.
pub mod cipher;
pub mod personalization;
pub mod store;

pub use cipher::{AesKey, HardwareBoundKey, StorageKey};
pub use personalization::{CredentialBuilder, ProvisionedCredential};
pub use store::{entry_additional_data, CredentialRecord, EntryRecord};

use crate::cbor::CborError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential data could not be decoded: {0}")]
    Decoding(CborError),
    #[error("credential data could not be encoded: {0}")]
    Encoding(CborError),
    #[error("unsupported credential data version {0}")]
    UnsupportedVersion(u64),
    #[error("authenticated decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("chunk size must be positive")]
    InvalidChunkSize,
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
    #[error("entry '{namespace}/{name}' is malformed: {reason}")]
    MalformedEntry {
        namespace: String,
        name: String,
        reason: &'static str,
    },
    #[error("access control profile {0} is malformed: {1}")]
    MalformedProfile(i32, &'static str),
}
