//! Thin helpers over [ciborium] used throughout the crate.
//!
//! Every decode in this crate goes through [from_slice], which rejects trailing bytes: a
//! persisted blob or a decrypted entry value must be exactly one CBOR data item.
use ciborium::Value;
use ciborium_io::Write as _;
use ciborium_ll::{Encoder, Header};
use serde::{de, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    /// CBOR input had extra data.
    #[error("extraneous data: {0} trailing bytes")]
    ExtraneousData(usize),
    /// Unexpected CBOR item encountered (got, want).
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
}

impl From<coset::CoseError> for CborError {
    fn from(e: coset::CoseError) -> Self {
        match e {
            coset::CoseError::EncodeFailed => CborError::EncodeFailed("COSE structure".to_string()),
            coset::CoseError::ExtraneousData => CborError::ExtraneousData(0),
            coset::CoseError::UnexpectedItem(got, want) => CborError::UnexpectedItem(got, want),
            other => CborError::DecodeFailed(other.to_string()),
        }
    }
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    let mut reader = slice;
    let value = ciborium::from_reader(&mut reader)
        .map_err(|e| CborError::DecodeFailed(e.to_string()))?;
    if !reader.is_empty() {
        return Err(CborError::ExtraneousData(reader.len()));
    }
    Ok(value)
}

/// Convert a `ciborium::Value` into a type `T`
#[allow(clippy::needless_pass_by_value)]
pub fn from_value<T>(value: Value) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    value
        .deserialized()
        .map_err(|e| CborError::DecodeFailed(e.to_string()))
}

pub fn into_value<S>(v: S) -> Result<Value, CborError>
where
    S: Serialize,
{
    Value::serialized(&v).map_err(|e| CborError::EncodeFailed(e.to_string()))
}

/// Number of bytes the given initial byte plus argument occupies on the wire.
pub fn header_len(header: Header) -> usize {
    let mut scratch: Vec<u8> = Vec::with_capacity(9);
    // Writes into a Vec cannot fail.
    let _ = Encoder::from(&mut scratch).push(header);
    scratch.len()
}

/// Number of bytes a definite-length text string occupies on the wire.
pub fn text_len(text: &str) -> usize {
    header_len(Header::Text(Some(text.len()))) + text.len()
}

/// Streams definite-length maps whose keys are text strings and whose values are already
/// encoded CBOR items. Values are copied verbatim, never re-encoded.
pub struct MapWriter<'a> {
    encoder: Encoder<&'a mut Vec<u8>>,
}

impl<'a> MapWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            encoder: Encoder::from(buf),
        }
    }

    pub fn map(&mut self, len: usize) -> Result<(), CborError> {
        self.encoder
            .push(Header::Map(Some(len)))
            .map_err(|e| CborError::EncodeFailed(e.to_string()))
    }

    pub fn key(&mut self, key: &str) -> Result<(), CborError> {
        self.encoder
            .text(key, None)
            .map_err(|e| CborError::EncodeFailed(e.to_string()))
    }

    pub fn encoded_value(&mut self, item: &[u8]) -> Result<(), CborError> {
        self.encoder
            .write_all(item)
            .map_err(|e| CborError::EncodeFailed(e.to_string()))
    }
}
