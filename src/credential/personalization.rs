//! Writing credential data.
//!
//! Entry values are CBOR-encoded, split into chunks and each chunk sealed with the entry's
//! additional data, so the stored ciphertext only decrypts at the location it was
//! provisioned for.
use super::cipher::{self, AesKey, HardwareBoundKey};
use super::store::{
    entry_additional_data, CredentialData, CredentialKeys, EntryRecord, EntryRecords,
    CREDENTIAL_DATA_VERSION,
};
use super::Error;
use crate::access_control::{AccessControlProfile, ProfileId, SecureAccessControlProfile};
use crate::cbor;
use crate::definitions::helpers::{ByteStr, NonEmptyVec};
use ciborium::Value;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use std::collections::{BTreeMap, BTreeSet};
use zeroize::Zeroizing;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

struct PendingEntry {
    value: Value,
    access_control_profile_ids: Vec<ProfileId>,
}

#[derive(Debug, Clone)]
pub struct ProvisionedCredential {
    pub credential_data: Vec<u8>,
    pub access_control_profiles: Vec<SecureAccessControlProfile>,
    pub credential_public_key: PublicKey,
}

pub struct CredentialBuilder {
    doc_type: String,
    test_credential: bool,
    chunk_size: usize,
    profiles: Vec<AccessControlProfile>,
    entries: BTreeMap<String, BTreeMap<String, PendingEntry>>,
}

impl CredentialBuilder {
    pub fn new(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            test_credential: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            profiles: Vec::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Test credentials are sealed with the well-known test key instead of the HBK.
    pub fn test_credential(mut self, test_credential: bool) -> Self {
        self.test_credential = test_credential;
        self
    }

    /// Largest plaintext chunk each entry value is split into.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn access_control_profile(mut self, profile: AccessControlProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn entry(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: Value,
        access_control_profile_ids: Vec<ProfileId>,
    ) -> Self {
        self.entries.entry(namespace.into()).or_default().insert(
            name.into(),
            PendingEntry {
                value,
                access_control_profile_ids,
            },
        );
        self
    }

    pub fn build(
        self,
        hardware_bound_key: &HardwareBoundKey,
    ) -> Result<ProvisionedCredential, Error> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        let mut profile_ids = BTreeSet::new();
        for profile in &self.profiles {
            if !profile_ids.insert(profile.id) {
                return Err(Error::MalformedProfile(profile.id, "duplicate profile id"));
            }
        }

        let storage_key = AesKey::generate();
        let credential_key = SecretKey::random(&mut OsRng);

        let mut namespaces = EntryRecords::new();
        for (namespace, entries) in &self.entries {
            let records = namespaces.entry(namespace.clone()).or_default();
            for (name, entry) in entries {
                if let Some(unknown) = entry
                    .access_control_profile_ids
                    .iter()
                    .find(|id| !profile_ids.contains(*id))
                {
                    return Err(Error::MalformedProfile(*unknown, "referenced but not provisioned"));
                }
                let record = seal_entry(&storage_key, namespace, name, entry, self.chunk_size)?;
                records.insert(name.clone(), record);
            }
        }

        let keys = CredentialKeys {
            storage_key: ByteStr::from(storage_key.as_bytes().to_vec()),
            credential_private_key: ByteStr::from(credential_key.to_bytes().to_vec()),
            namespaces,
        };
        let keys_plaintext = Zeroizing::new(cbor::to_vec(&keys).map_err(Error::Encoding)?);

        let test_key = AesKey::test_key();
        let sealing_key = if self.test_credential {
            &test_key
        } else {
            hardware_bound_key
        };
        let data = CredentialData {
            version: CREDENTIAL_DATA_VERSION,
            doc_type: self.doc_type.clone(),
            test_credential: self.test_credential,
            encrypted_credential_keys: cipher::encrypt(
                sealing_key,
                &keys_plaintext,
                self.doc_type.as_bytes(),
            )?
            .into(),
        };

        let access_control_profiles = self
            .profiles
            .into_iter()
            .map(|profile| profile.seal(&storage_key))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            doc_type = %self.doc_type,
            test_credential = self.test_credential,
            "provisioned credential"
        );
        Ok(ProvisionedCredential {
            credential_data: cbor::to_vec(&data).map_err(Error::Encoding)?,
            access_control_profiles,
            credential_public_key: credential_key.public_key(),
        })
    }
}

fn seal_entry(
    storage_key: &AesKey,
    namespace: &str,
    name: &str,
    entry: &PendingEntry,
    chunk_size: usize,
) -> Result<EntryRecord, Error> {
    let plaintext = cbor::to_vec(&entry.value).map_err(Error::Encoding)?;
    let aad = entry_additional_data(namespace, name, &entry.access_control_profile_ids)
        .map_err(Error::Encoding)?;
    let chunks = plaintext
        .chunks(chunk_size)
        .map(|chunk| cipher::encrypt(storage_key, chunk, &aad).map(ByteStr::from))
        .collect::<Result<Vec<_>, _>>()?;
    let encrypted_chunks = NonEmptyVec::try_from(chunks).map_err(|_| Error::MalformedEntry {
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason: "value encoded to nothing",
    })?;
    Ok(EntryRecord {
        size: plaintext.len() as u64,
        access_control_profile_ids: entry.access_control_profile_ids.clone(),
        encrypted_chunks,
    })
}
