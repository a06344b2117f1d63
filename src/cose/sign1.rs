use super::{Error, Result, SignatureAlgorithm};
use coset::{iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder};
use signature::{Signer, Verifier};

/// Produce a tagless, detached `COSE_Sign1` over `payload`.
pub fn sign_detached<S>(signer: &S, payload: &[u8]) -> Result<CoseSign1>
where
    S: Signer<p256::ecdsa::Signature> + SignatureAlgorithm,
{
    let protected = HeaderBuilder::new().algorithm(signer.algorithm()).build();
    CoseSign1Builder::new()
        .protected(protected)
        .try_create_detached_signature(payload, &[], |data| {
            signer
                .try_sign(data)
                .map(|sig| sig.to_bytes().to_vec())
                .map_err(|_| Error::SigningFailed)
        })
        .map(CoseSign1Builder::build)
}

/// Produce a `COSE_Sign1` that carries `payload` inline.
pub fn sign_attached<S>(signer: &S, payload: Vec<u8>) -> Result<CoseSign1>
where
    S: Signer<p256::ecdsa::Signature> + SignatureAlgorithm,
{
    let protected = HeaderBuilder::new().algorithm(signer.algorithm()).build();
    CoseSign1Builder::new()
        .protected(protected)
        .payload(payload)
        .try_create_signature(&[], |data| {
            signer
                .try_sign(data)
                .map(|sig| sig.to_bytes().to_vec())
                .map_err(|_| Error::SigningFailed)
        })
        .map(CoseSign1Builder::build)
}

/// Public keys a `COSE_Sign1` can be checked against.
#[derive(Debug, Clone)]
pub enum VerificationKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl VerificationKey {
    /// Parse an uncompressed or compressed SEC1 point, choosing the curve from its length.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            33 | 65 => p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(Self::P256)
                .map_err(|_| Error::InvalidPublicKey),
            49 | 97 => p384::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(Self::P384)
                .map_err(|_| Error::InvalidPublicKey),
            _ => Err(Error::InvalidPublicKey),
        }
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            Self::P256(key) => {
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::MalformedSignature)?;
                key.verify(data, &signature)
                    .map_err(|_| Error::VerificationFailed)
            }
            Self::P384(key) => {
                let signature = p384::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::MalformedSignature)?;
                key.verify(data, &signature)
                    .map_err(|_| Error::VerificationFailed)
            }
        }
    }
}

impl SignatureAlgorithm for VerificationKey {
    fn algorithm(&self) -> iana::Algorithm {
        match self {
            Self::P256(key) => key.algorithm(),
            Self::P384(key) => key.algorithm(),
        }
    }
}

/// Verify a detached `COSE_Sign1`, checking that its protected algorithm matches the key.
pub fn verify_detached(sign1: &CoseSign1, payload: &[u8], key: &VerificationKey) -> Result<()> {
    check_algorithm(sign1, key)?;
    sign1.verify_detached_signature(payload, &[], |signature, data| key.verify(data, signature))
}

/// Verify a `COSE_Sign1` that carries its payload inline.
pub fn verify_attached(sign1: &CoseSign1, key: &VerificationKey) -> Result<()> {
    check_algorithm(sign1, key)?;
    sign1.verify_signature(&[], |signature, data| key.verify(data, signature))
}

fn check_algorithm(sign1: &CoseSign1, key: &VerificationKey) -> Result<()> {
    let expected = coset::Algorithm::Assigned(key.algorithm());
    match &sign1.protected.header.alg {
        Some(alg) if *alg == expected => Ok(()),
        other => Err(Error::UnsupportedAlgorithm(other.clone())),
    }
}

pub fn to_vec(sign1: CoseSign1) -> Result<Vec<u8>> {
    sign1.to_vec().map_err(Error::Encoding)
}

pub fn from_slice(bytes: &[u8]) -> Result<CoseSign1> {
    CoseSign1::from_slice(bytes).map_err(Error::Decoding)
}

mod p256_impls {
    use crate::cose::SignatureAlgorithm;
    use coset::iana;
    use p256::ecdsa::{SigningKey, VerifyingKey};

    impl SignatureAlgorithm for SigningKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES256
        }
    }

    impl SignatureAlgorithm for VerifyingKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES256
        }
    }
}

mod p384_impls {
    use crate::cose::SignatureAlgorithm;
    use coset::iana;
    use p384::ecdsa::VerifyingKey;

    impl SignatureAlgorithm for VerifyingKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES384
        }
    }
}
