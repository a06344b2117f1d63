//! The caller-facing retrieval protocol.
//!
//! [IdentityCredentialApi] is the full operation set a transport exposes. [IdentityCredential]
//! implements it in-process; nothing in here knows how calls arrive.
//!
//! A typical signature-authenticated retrieval:
//!
//! ```text
//! initialize
//! create_ephemeral_key_pair
//! [set_reader_ephemeral_public_key]   ; selects MAC authentication
//! [create_auth_challenge]
//! set_requested_namespaces
//! start_retrieval
//! { start_retrieve_entry_value { retrieve_entry_value } }
//! finish_retrieval
//! ```
pub mod session;

pub use session::{IdentityCredential, State, WithheldEntry, WithholdReason};

use crate::access_control::{AccessDenial, HardwareAuthToken, SecureAccessControlProfile};
use crate::cbor::CborError;
use crate::definitions::device_request::{AccessControlProfileId, RequestNamespace};
use crate::definitions::{device_namespaces, session as transcript};
use crate::{cose, credential};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or stored data. Aborts the session.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The operation is not allowed in the current state. The state is left unchanged.
    #[error("operation not allowed now: {0}")]
    OrderViolation(&'static str),
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("session transcript does not contain the device ephemeral key")]
    EphemeralKeyNotFound,
    #[error("no signing key was supplied")]
    SigningKeyNotFound,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Status values a transport reports for each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum StatusCode {
    Ok,
    InvalidData,
    OrderViolation,
    CryptoError,
    EphemeralKeyNotFound,
    SigningKeyNotFound,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidData(_) => StatusCode::InvalidData,
            Error::OrderViolation(_) => StatusCode::OrderViolation,
            Error::Crypto(_) => StatusCode::CryptoError,
            Error::EphemeralKeyNotFound => StatusCode::EphemeralKeyNotFound,
            Error::SigningKeyNotFound => StatusCode::SigningKeyNotFound,
        }
    }
}

impl From<credential::Error> for Error {
    fn from(e: credential::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<device_namespaces::Error> for Error {
    fn from(e: device_namespaces::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<transcript::Error> for Error {
    fn from(e: transcript::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<cose::Error> for Error {
    fn from(e: cose::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

/// Outcome of `start_retrieve_entry_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAccess {
    /// Feed the entry's chunks to `retrieve_entry_value`.
    Granted,
    /// The entry is left out of the response. No chunks are expected.
    Withheld(AccessDenial),
}

/// Inputs to `start_retrieval`. Empty byte vectors mean "not supplied".
#[derive(Debug, Clone, Default)]
pub struct RetrievalParameters {
    pub access_control_profiles: Vec<SecureAccessControlProfile>,
    pub auth_token: Option<HardwareAuthToken>,
    /// The reader's CBOR `ItemsRequest`, as signed by the reader.
    pub items_request: Vec<u8>,
    /// A key blob from `generate_signing_key_pair`.
    pub signing_key_blob: Vec<u8>,
    pub session_transcript: Vec<u8>,
    /// Tagless `COSE_Sign1` with a detached payload over `ReaderAuthenticationBytes`.
    pub reader_signature: Vec<u8>,
    /// Number of entries requested per namespace, in request order.
    pub request_counts: Vec<usize>,
}

pub trait IdentityCredentialApi {
    /// Decrypt and load the credential. Must succeed before anything else.
    fn initialize(&mut self) -> Result<()>;

    /// Returns the uncompressed SEC1 encoding of the device ephemeral public key.
    fn create_ephemeral_key_pair(&mut self) -> Result<Vec<u8>>;

    /// Selects MAC authentication of the response.
    fn set_reader_ephemeral_public_key(&mut self, public_key: &[u8]) -> Result<()>;

    /// Returns a fresh nonzero challenge that user authentication tokens must carry.
    fn create_auth_challenge(&mut self) -> Result<i64>;

    fn set_requested_namespaces(&mut self, requests: Vec<RequestNamespace>) -> Result<()>;

    fn start_retrieval(&mut self, parameters: RetrievalParameters) -> Result<()>;

    fn start_retrieve_entry_value(
        &mut self,
        namespace: &str,
        name: &str,
        entry_size: u64,
        access_control_profile_ids: &[AccessControlProfileId],
    ) -> Result<EntryAccess>;

    /// Decrypt one chunk of the entry started last, returning its plaintext.
    fn retrieve_entry_value(&mut self, encrypted_chunk: &[u8]) -> Result<Vec<u8>>;

    /// Returns the authentication tag and the encoded `DeviceNameSpaces` it covers.
    fn finish_retrieval(&mut self) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Returns a `COSE_Sign1` over `["ProofOfDeletion", docType, testCredential]`.
    fn delete_credential(&mut self) -> Result<Vec<u8>>;

    /// Returns a key blob for `start_retrieval` and a `COSE_Sign1` certifying its public key.
    fn generate_signing_key_pair(&mut self) -> Result<(Vec<u8>, Vec<u8>)>;
}
