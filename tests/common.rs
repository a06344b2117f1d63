#![allow(dead_code)]

use anyhow::{Context, Result};
use ciborium::Value;
use coset::CborSerializable;
use p256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use signature::Verifier;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use identity_credential::access_control::{AccessControlProfile, FixedClock};
use identity_credential::cbor;
use identity_credential::cose::sign1::{self, VerificationKey};
use identity_credential::credential::{AesKey, CredentialBuilder, ProvisionedCredential};
use identity_credential::presentation::{EntryAccess, IdentityCredential, IdentityCredentialApi};

pub const DOC_TYPE: &str = "org.example.credential";
pub const NAMESPACE: &str = "ns";

pub const READER_CERT: &str = include_str!("data/reader_p256_cert.pem");
pub const READER_KEY: &str = include_str!("data/reader_p256_key.pem");
pub const OTHER_READER_CERT: &str = include_str!("data/other_reader_p256_cert.pem");
pub const READER_P384_CERT: &str = include_str!("data/reader_p384_cert.pem");
pub const READER_P384_KEY: &str = include_str!("data/reader_p384_key.pem");

/// Wall clock every session in the tests runs at.
pub const NOW_MILLIS: u64 = 1_700_000_000_000;

pub fn reader_key() -> SigningKey {
    p256::SecretKey::from_sec1_pem(READER_KEY)
        .expect("reader key fixture")
        .into()
}

/// Provision a credential under a fresh hardware-bound key and wrap it in a session.
pub fn provision(
    builder: CredentialBuilder,
) -> Result<(IdentityCredential<FixedClock>, ProvisionedCredential)> {
    let hbk = AesKey::generate();
    let provisioned = builder.build(&hbk)?;
    let credential = IdentityCredential::with_clock(
        provisioned.credential_data.clone(),
        hbk,
        FixedClock(NOW_MILLIS),
    );
    Ok((credential, provisioned))
}

/// One no-auth profile with id 0 and a single entry `ns/name = "value"`.
pub fn single_entry() -> CredentialBuilder {
    CredentialBuilder::new(DOC_TYPE)
        .access_control_profile(AccessControlProfile::no_auth(0))
        .entry(NAMESPACE, "name", Value::Text("value".into()), vec![0])
}

pub fn encrypted_chunks(
    credential: &IdentityCredential<FixedClock>,
    namespace: &str,
    name: &str,
) -> Result<Vec<Vec<u8>>> {
    let entry = credential
        .record()
        .context("credential not initialized")?
        .entry(namespace, name)
        .context("no such entry")?;
    Ok(entry
        .encrypted_chunks
        .iter()
        .map(|chunk| chunk.as_ref().to_vec())
        .collect())
}

/// Start an entry and, when granted, feed it every stored chunk. Returns the plaintext.
pub fn retrieve(
    credential: &mut IdentityCredential<FixedClock>,
    namespace: &str,
    name: &str,
    profile_ids: &[i32],
) -> Result<(EntryAccess, Vec<u8>)> {
    let chunks = encrypted_chunks(credential, namespace, name)?;
    let size = credential
        .record()
        .and_then(|record| record.entry(namespace, name))
        .context("no such entry")?
        .size;
    let access = credential.start_retrieve_entry_value(namespace, name, size, profile_ids)?;
    let mut plaintext = Vec::new();
    if access == EntryAccess::Granted {
        for chunk in chunks {
            plaintext.extend(credential.retrieve_entry_value(&chunk)?);
        }
    }
    Ok((access, plaintext))
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).expect("encoding into a Vec");
    bytes
}

pub fn decode(bytes: &[u8]) -> Value {
    cbor::from_slice(bytes).expect("one CBOR item")
}

pub fn tag24(value: &Value) -> Value {
    Value::Tag(24, Box::new(Value::Bytes(encode(value))))
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
}

/// A transcript that embeds the device engagement key the way a real one does.
pub fn session_transcript(device_public_key: &[u8]) -> Value {
    Value::Array(vec![
        tag24(&map(vec![("eDeviceKey", Value::Bytes(device_public_key.to_vec()))])),
        Value::Null,
        Value::Null,
    ])
}

pub fn items_request(doc_type: &str, namespaces: &[(&str, &[&str])]) -> Vec<u8> {
    let namespaces = namespaces
        .iter()
        .map(|(namespace, names)| {
            let elements = names.iter().map(|name| (*name, Value::Bool(false))).collect();
            (*namespace, map(elements))
        })
        .collect();
    encode(&map(vec![
        ("docType", text(doc_type)),
        ("nameSpaces", map(namespaces)),
    ]))
}

pub fn reader_authentication_bytes(transcript: &Value, items_request: &[u8]) -> Vec<u8> {
    encode(&tag24(&Value::Array(vec![
        text("ReaderAuthentication"),
        transcript.clone(),
        Value::Tag(24, Box::new(Value::Bytes(items_request.to_vec()))),
    ])))
}

pub fn device_authentication_bytes(
    transcript: &Value,
    doc_type: &str,
    namespaces: &[u8],
) -> Vec<u8> {
    encode(&tag24(&Value::Array(vec![
        text("DeviceAuthentication"),
        transcript.clone(),
        text(doc_type),
        Value::Tag(24, Box::new(Value::Bytes(namespaces.to_vec()))),
    ])))
}

pub fn reader_signature(key: &SigningKey, transcript: &Value, items_request: &[u8]) -> Vec<u8> {
    let payload = reader_authentication_bytes(transcript, items_request);
    let signature = sign1::sign_detached(key, &payload).expect("signing with a P-256 key");
    signature.to_vec().expect("encoding COSE_Sign1")
}

/// `SHA-256` of the session transcript as bound into key derivation.
pub fn transcript_salt(transcript: &Value) -> [u8; 32] {
    Sha256::digest(encode(&tag24(transcript))).into()
}

/// Check a certificate from `generate_signing_key_pair` and return the key it certifies.
pub fn certified_key(
    credential_key: &p256::PublicKey,
    certificate: &[u8],
) -> Result<VerificationKey> {
    let certificate = Certificate::from_der(certificate)?;
    let tbs_certificate = certificate.tbs_certificate.to_der()?;
    let signature = p256::ecdsa::Signature::from_der(
        certificate
            .signature
            .as_bytes()
            .context("certificate signature is not octet aligned")?,
    )?;
    p256::ecdsa::VerifyingKey::from(credential_key).verify(&tbs_certificate, &signature)?;

    let subject_public_key = certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .context("subject public key is not octet aligned")?;
    Ok(VerificationKey::from_sec1_bytes(subject_public_key)?)
}
