//! Retrieval session engine for an encrypted, access-controlled identity credential.
//!
//! A credential is provisioned once with [credential::CredentialBuilder], producing opaque
//! credential data plus sealed [access_control::SecureAccessControlProfile]s. At presentation
//! time an [presentation::IdentityCredential] decrypts that data and walks a reader through a
//! strictly ordered protocol, releasing only the entries the reader is entitled to and
//! authenticating the result to the session with a MAC or a signature.
//!
//! ```no_run
//! use ciborium::Value;
//! use identity_credential::access_control::AccessControlProfile;
//! use identity_credential::credential::{AesKey, CredentialBuilder};
//! use identity_credential::definitions::device_request::RequestNamespace;
//! use identity_credential::presentation::{
//!     EntryAccess, IdentityCredential, IdentityCredentialApi, RetrievalParameters,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hbk = AesKey::generate();
//! let provisioned = CredentialBuilder::new("org.example.doc")
//!     .access_control_profile(AccessControlProfile::no_auth(0))
//!     .entry("ns", "name", Value::Text("value".into()), vec![0])
//!     .build(&hbk)?;
//!
//! let mut credential = IdentityCredential::new(provisioned.credential_data, hbk);
//! credential.initialize()?;
//! credential.create_ephemeral_key_pair()?;
//! credential.set_requested_namespaces(vec![
//!     RequestNamespace::new("ns").item("name", 6, vec![0])
//! ])?;
//! let (signing_key_blob, _certificate) = credential.generate_signing_key_pair()?;
//! credential.start_retrieval(RetrievalParameters {
//!     access_control_profiles: provisioned.access_control_profiles,
//!     signing_key_blob,
//!     request_counts: vec![1],
//!     ..Default::default()
//! })?;
//!
//! let chunks = credential.record().unwrap().entry("ns", "name").unwrap().encrypted_chunks.clone();
//! if credential.start_retrieve_entry_value("ns", "name", 6, &[0])? == EntryAccess::Granted {
//!     for chunk in chunks.iter() {
//!         credential.retrieve_entry_value(chunk.as_ref())?;
//!     }
//! }
//! let (_signature, _device_namespaces) = credential.finish_retrieval()?;
//! # Ok(())
//! # }
//! ```
pub mod access_control;
pub mod cbor;
pub mod cose;
pub mod credential;
pub mod definitions;
pub mod presentation;
