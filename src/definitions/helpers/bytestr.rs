use serde::{Deserialize, Serialize};

/// Bytes that always encode as a CBOR byte string rather than an array of integers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ByteStr(#[serde(with = "serde_bytes")] Vec<u8>);

impl ByteStr {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteStr {
    fn from(bytes: Vec<u8>) -> ByteStr {
        ByteStr(bytes)
    }
}

impl From<ByteStr> for Vec<u8> {
    fn from(ByteStr(bytes): ByteStr) -> Vec<u8> {
        bytes
    }
}

impl AsRef<[u8]> for ByteStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::ByteStr;
    use crate::cbor;

    #[test]
    fn encodes_as_bstr() {
        let bytes = cbor::to_vec(&ByteStr::from(vec![1, 2, 3])).unwrap();
        assert_eq!(bytes, vec![0x43, 1, 2, 3]);
    }
}
