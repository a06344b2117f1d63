//! COSE framing for the authentication tags this crate produces and checks.
//!
//! Tags are always emitted with a detached payload: the reader reconstructs the payload
//! (`DeviceAuthenticationBytes` or `ReaderAuthenticationBytes`) from the session itself.
pub mod mac0;
pub mod sign1;

use coset::iana;

/// Trait to represent the signature algorithm of a signer or verifier.
pub trait SignatureAlgorithm {
    fn algorithm(&self) -> iana::Algorithm;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to encode COSE structure: {0}")]
    Encoding(coset::CoseError),
    #[error("unable to decode COSE structure: {0}")]
    Decoding(coset::CoseError),
    #[error("unsupported algorithm: {0:?}")]
    UnsupportedAlgorithm(Option<coset::Algorithm>),
    #[error("unable to produce signature")]
    SigningFailed,
    #[error("signature is malformed")]
    MalformedSignature,
    #[error("public key is not a supported SEC1 point")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("invalid MAC key length")]
    InvalidMacKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
