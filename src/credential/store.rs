//! Decrypt and parse persisted credential data.
//!
//! ```text
//! CredentialData = {
//!   "version": 1,
//!   "docType": tstr,
//!   "testCredential": bool,
//!   "encryptedCredentialKeys": bstr      ; AES-128-GCM under the HBK, AAD = docType
//! }
//! CredentialKeys = {
//!   "storageKey": bstr .size 16,
//!   "credentialPrivateKey": bstr .size 32,
//!   "nameSpaces": { * tstr => { * tstr => EntryRecord } }
//! }
//! EntryRecord = { "size": uint, "accessControlProfileIds": [* int], "encryptedChunks": [+ bstr] }
//! ```
use super::cipher::{self, AesKey, HardwareBoundKey, StorageKey};
use super::Error;
use crate::cbor::{self, CborError};
use crate::definitions::helpers::{ByteStr, NonEmptyVec};
use p256::ecdsa::SigningKey;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

pub const CREDENTIAL_DATA_VERSION: u64 = 1;

pub type EntryRecords = BTreeMap<String, BTreeMap<String, EntryRecord>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CredentialData {
    pub version: u64,
    pub doc_type: String,
    pub test_credential: bool,
    pub encrypted_credential_keys: ByteStr,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CredentialKeys {
    pub storage_key: ByteStr,
    pub credential_private_key: ByteStr,
    #[serde(rename = "nameSpaces")]
    pub namespaces: EntryRecords,
}

/// Where one entry lives in storage and who may read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryRecord {
    /// Length of the CBOR-encoded plaintext value.
    pub size: u64,
    pub access_control_profile_ids: Vec<i32>,
    pub encrypted_chunks: NonEmptyVec<ByteStr>,
}

#[derive(Serialize)]
struct EntryAdditionalData<'a> {
    #[serde(rename = "Namespace")]
    namespace: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "AccessControlProfileIds")]
    access_control_profile_ids: &'a [i32],
}

/// AAD binding an entry's ciphertext to its location and access policy.
pub fn entry_additional_data(
    namespace: &str,
    name: &str,
    access_control_profile_ids: &[i32],
) -> Result<Vec<u8>, CborError> {
    cbor::to_vec(&EntryAdditionalData {
        namespace,
        name,
        access_control_profile_ids,
    })
}

/// The decrypted credential. Read-only once loaded.
pub struct CredentialRecord {
    doc_type: String,
    test_credential: bool,
    storage_key: StorageKey,
    credential_key: SecretKey,
    namespaces: EntryRecords,
}

impl CredentialRecord {
    /// Parse `credential_data` completely or not at all.
    ///
    /// Test credentials are always decrypted with [AesKey::test_key], whatever
    /// `hardware_bound_key` is.
    pub fn load(
        credential_data: &[u8],
        hardware_bound_key: &HardwareBoundKey,
    ) -> Result<Self, Error> {
        let data: CredentialData = cbor::from_slice(credential_data).map_err(Error::Decoding)?;
        if data.version != CREDENTIAL_DATA_VERSION {
            return Err(Error::UnsupportedVersion(data.version));
        }

        let test_key = AesKey::test_key();
        let key = if data.test_credential {
            &test_key
        } else {
            hardware_bound_key
        };
        let plaintext = Zeroizing::new(cipher::decrypt(
            key,
            data.encrypted_credential_keys.as_ref(),
            data.doc_type.as_bytes(),
        )?);
        let keys: CredentialKeys = cbor::from_slice(&plaintext).map_err(Error::Decoding)?;

        let storage_key = AesKey::from_slice(keys.storage_key.as_ref())?;
        let key_bytes = Zeroizing::new(Vec::from(keys.credential_private_key));
        if key_bytes.len() != 32 {
            return Err(Error::InvalidKey("credential key must be a 32 byte P-256 scalar"));
        }
        let credential_key = SecretKey::from_slice(&key_bytes)
            .map_err(|_| Error::InvalidKey("credential key is not a valid P-256 scalar"))?;

        for (namespace, entries) in &keys.namespaces {
            for (name, entry) in entries {
                check_entry(namespace, name, entry)?;
            }
        }

        Ok(Self {
            doc_type: data.doc_type,
            test_credential: data.test_credential,
            storage_key,
            credential_key,
            namespaces: keys.namespaces,
        })
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn is_test_credential(&self) -> bool {
        self.test_credential
    }

    pub fn namespaces(&self) -> &EntryRecords {
        &self.namespaces
    }

    pub fn entry(&self, namespace: &str, name: &str) -> Option<&EntryRecord> {
        self.namespaces.get(namespace)?.get(name)
    }

    pub fn credential_public_key(&self) -> PublicKey {
        self.credential_key.public_key()
    }

    pub(crate) fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub(crate) fn credential_signing_key(&self) -> SigningKey {
        SigningKey::from(&self.credential_key)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("doc_type", &self.doc_type)
            .field("test_credential", &self.test_credential)
            .field("namespaces", &self.namespaces)
            .finish_non_exhaustive()
    }
}

fn check_entry(namespace: &str, name: &str, entry: &EntryRecord) -> Result<(), Error> {
    let malformed = |reason| Error::MalformedEntry {
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason,
    };
    if entry.size == 0 {
        return Err(malformed("declared size is zero"));
    }
    let stored: usize = entry
        .encrypted_chunks
        .iter()
        .map(|chunk| cipher::plaintext_len(chunk.len()))
        .sum::<Option<usize>>()
        .ok_or_else(|| malformed("chunk is shorter than nonce and tag"))?;
    if stored as u64 != entry.size {
        return Err(malformed("chunks do not add up to the declared size"));
    }
    Ok(())
}
