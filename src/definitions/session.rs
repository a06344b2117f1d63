//! Key agreement and the structures that bind a response to one session.
//!
//! ```text
//! SessionTranscriptBytes     = #6.24(bstr .cbor SessionTranscript)
//! ReaderAuthenticationBytes  = #6.24(bstr .cbor ["ReaderAuthentication", SessionTranscript, ItemsRequestBytes])
//! DeviceAuthenticationBytes  = #6.24(bstr .cbor ["DeviceAuthentication", SessionTranscript, DocType, DeviceNameSpacesBytes])
//! EMacKey                    = HKDF-SHA256(ECDH(eDevice, eReader), SHA-256(SessionTranscriptBytes), "EMacKey", 32)
//! ```
//!
//! An absent session transcript is bound as CBOR `null`.
use crate::cbor::{self, CborError};
use crate::definitions::device_request::ItemsRequestBytes;
use crate::definitions::helpers::{tag24, Tag24};
use ciborium::Value;
use elliptic_curve::ecdh::{EphemeralSecret, SharedSecret};
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use p256::{NistP256, PublicKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub type EDeviceKey = EphemeralSecret<NistP256>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session transcript is not a single CBOR data item: {0}")]
    MalformedTranscript(CborError),
    #[error("unable to encode value as CBOR: {0}")]
    Tag24CborEncoding(tag24::Error),
    #[error("unable to perform HKDF")]
    Hkdf,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Generate a fresh device ephemeral key pair for one session.
pub fn create_p256_ephemeral_keys() -> (EDeviceKey, PublicKey) {
    let e_device_key = EphemeralSecret::<NistP256>::random(&mut OsRng);
    let e_device_key_pub = e_device_key.public_key();
    (e_device_key, e_device_key_pub)
}

/// Uncompressed SEC1 encoding of a P-256 public key.
pub fn encode_public_key(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(false).as_bytes().to_vec()
}

pub fn get_shared_secret(
    e_reader_key: &PublicKey,
    e_device_key: &EDeviceKey,
) -> SharedSecret<NistP256> {
    e_device_key.diffie_hellman(e_reader_key)
}

#[derive(Serialize)]
struct ReaderAuthentication<'a>(&'static str, &'a Value, &'a ItemsRequestBytes);

#[derive(Serialize)]
struct DeviceAuthentication<'a>(&'static str, &'a Value, &'a str, &'a Tag24<Value>);

/// The session transcript supplied at `startRetrieval`, parsed once and bound into every
/// authentication structure the session computes.
#[derive(Debug, Clone)]
pub struct SessionTranscriptBinder {
    bytes: Vec<u8>,
    item: Value,
}

impl SessionTranscriptBinder {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let item = if bytes.is_empty() {
            Value::Null
        } else {
            cbor::from_slice(&bytes).map_err(Error::MalformedTranscript)?
        };
        Ok(Self { bytes, item })
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn item(&self) -> &Value {
        &self.item
    }

    /// Whether both coordinates of `public_key` occur in the transcript.
    ///
    /// The transcript embeds the device engagement, which carries the device ephemeral key;
    /// a transcript lacking it belongs to some other session.
    pub fn contains_ephemeral_key(&self, public_key: &PublicKey) -> bool {
        let point = public_key.to_encoded_point(false);
        match (point.x(), point.y()) {
            (Some(x), Some(y)) => contains(&self.bytes, x) && contains(&self.bytes, y),
            _ => false,
        }
    }

    fn session_transcript_bytes(&self) -> Result<Vec<u8>> {
        Tag24::new(&self.item)
            .and_then(|tagged| tagged.to_vec())
            .map_err(Error::Tag24CborEncoding)
    }

    pub fn reader_authentication_bytes(
        &self,
        items_request: &ItemsRequestBytes,
    ) -> Result<Vec<u8>> {
        let reader_authentication =
            ReaderAuthentication("ReaderAuthentication", &self.item, items_request);
        Tag24::new(reader_authentication)
            .and_then(|tagged| tagged.to_vec())
            .map_err(Error::Tag24CborEncoding)
    }

    pub fn device_authentication_bytes(
        &self,
        doc_type: &str,
        device_namespaces: &[u8],
    ) -> Result<Vec<u8>> {
        let namespaces_bytes = Tag24::<Value>::from_bytes(device_namespaces.to_vec())
            .map_err(Error::Tag24CborEncoding)?;
        let device_authentication =
            DeviceAuthentication("DeviceAuthentication", &self.item, doc_type, &namespaces_bytes);
        Tag24::new(device_authentication)
            .and_then(|tagged| tagged.to_vec())
            .map_err(Error::Tag24CborEncoding)
    }

    /// Derive the session MAC key from the device/reader shared secret.
    pub fn derive_emac_key(&self, shared_secret: &SharedSecret<NistP256>) -> Result<[u8; 32]> {
        let salt = Sha256::digest(self.session_transcript_bytes()?);
        let mut emac_key = [0u8; 32];
        Hkdf::<Sha256>::new(Some(salt.as_ref()), shared_secret.raw_secret_bytes())
            .expand(b"EMacKey", &mut emac_key)
            .map_err(|_| Error::Hkdf)?;
        Ok(emac_key)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn both_parties_derive_the_same_emac_key() {
        let (device, device_pub) = create_p256_ephemeral_keys();
        let (reader, reader_pub) = create_p256_ephemeral_keys();
        let transcript = cbor::to_vec(&Value::Array(vec![Value::Null])).unwrap();
        let binder = SessionTranscriptBinder::new(transcript).unwrap();

        let device_side = binder
            .derive_emac_key(&get_shared_secret(&reader_pub, &device))
            .unwrap();
        let reader_side = binder
            .derive_emac_key(&get_shared_secret(&device_pub, &reader))
            .unwrap();
        assert_eq!(device_side, reader_side);
    }

    #[test]
    fn transcript_must_carry_the_ephemeral_key() {
        let (_, device_pub) = create_p256_ephemeral_keys();
        let encoded = encode_public_key(&device_pub);
        let with_key =
            cbor::to_vec(&Value::Array(vec![Value::Bytes(encoded), Value::Null])).unwrap();
        let binder = SessionTranscriptBinder::new(with_key).unwrap();
        assert!(binder.contains_ephemeral_key(&device_pub));

        let (_, other_pub) = create_p256_ephemeral_keys();
        assert!(!binder.contains_ephemeral_key(&other_pub));
    }

    #[test]
    fn empty_transcript_binds_as_null() {
        let binder = SessionTranscriptBinder::new(Vec::new()).unwrap();
        assert!(binder.is_empty());
        assert_eq!(binder.item(), &Value::Null);

        let bytes = binder.device_authentication_bytes("doc", &[0xa0]).unwrap();
        let tagged: Tag24<Value> = cbor::from_slice(&bytes).unwrap();
        assert_eq!(
            tagged.into_inner(),
            Value::Array(vec![
                Value::Text("DeviceAuthentication".into()),
                Value::Null,
                Value::Text("doc".into()),
                Value::Tag(24, Box::new(Value::Bytes(vec![0xa0]))),
            ])
        );
    }

    #[test]
    fn malformed_transcript_is_rejected() {
        assert!(matches!(
            SessionTranscriptBinder::new(vec![0x82, 0x01]),
            Err(Error::MalformedTranscript(_))
        ));
    }
}
