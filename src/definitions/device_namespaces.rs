//! Incremental construction of `DeviceNameSpaces`:
//!
//! ```text
//! DeviceNameSpaces = { * NameSpace => DeviceSignedItems }
//! DeviceSignedItems = { + DataElementIdentifier => DataElementValue }
//! ```
//!
//! Namespaces are filled one at a time. Each entry value is the CBOR item that was decrypted
//! from the credential, copied byte for byte into the output. Keys are emitted in ascending
//! order at both levels, so equal inputs always encode to equal bytes.
use crate::cbor::{self, CborError, MapWriter};
use crate::definitions::device_request::RequestNamespace;
use ciborium_ll::Header;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("namespace '{0}' is still open")]
    NamespaceStillOpen(String),
    #[error("no namespace is open")]
    NoOpenNamespace,
    #[error("namespace '{0}' was already closed")]
    NamespaceAlreadyClosed(String),
    #[error("entry '{0}' was already appended")]
    DuplicateEntry(String),
    #[error("encoded size {actual} exceeds the estimate of {estimate} bytes")]
    BudgetExceeded { estimate: usize, actual: usize },
    #[error(transparent)]
    Cbor(#[from] CborError),
}

type Result<T, E = Error> = std::result::Result<T, E>;

type EncodedItems = BTreeMap<String, Vec<u8>>;

/// Upper bound on the encoded size of the `DeviceNameSpaces` answering `requests`.
///
/// Assumes every requested entry is released: withholding entries or whole namespaces only
/// shrinks the map headers and drops bytes, so the bound holds for any access outcome.
pub fn estimate_size(requests: &[RequestNamespace]) -> usize {
    let namespaces: usize = requests
        .iter()
        .map(|request| {
            let entries: usize = request
                .items
                .iter()
                .map(|item| cbor::text_len(&item.name) + item.size as usize)
                .sum();
            cbor::text_len(&request.namespace_name)
                + cbor::header_len(Header::Map(Some(request.items.len())))
                + entries
        })
        .sum();
    cbor::header_len(Header::Map(Some(requests.len()))) + namespaces
}

/// Append-only builder for `DeviceNameSpaces`, owned by a single retrieval session.
#[derive(Debug)]
pub struct DeviceNamespacesBuilder {
    estimate: usize,
    closed: BTreeMap<String, EncodedItems>,
    visited: Vec<String>,
    current: Option<(String, EncodedItems)>,
}

impl DeviceNamespacesBuilder {
    pub fn new(estimate: usize) -> Self {
        Self {
            estimate,
            closed: BTreeMap::new(),
            visited: Vec::new(),
            current: None,
        }
    }

    pub fn estimate(&self) -> usize {
        self.estimate
    }

    pub fn current_namespace(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn open_namespace(&mut self, namespace: &str) -> Result<()> {
        if let Some((open, _)) = &self.current {
            return Err(Error::NamespaceStillOpen(open.clone()));
        }
        if self.visited.iter().any(|visited| visited == namespace) {
            return Err(Error::NamespaceAlreadyClosed(namespace.to_string()));
        }
        self.visited.push(namespace.to_string());
        self.current = Some((namespace.to_string(), EncodedItems::new()));
        Ok(())
    }

    /// Append one released entry to the open namespace. `value` must be a single encoded item.
    pub fn append(&mut self, name: &str, value: Vec<u8>) -> Result<()> {
        let (_, items) = self.current.as_mut().ok_or(Error::NoOpenNamespace)?;
        if items.contains_key(name) {
            return Err(Error::DuplicateEntry(name.to_string()));
        }
        items.insert(name.to_string(), value);
        Ok(())
    }

    /// Close the open namespace, folding it into the response if anything was released.
    pub fn close_namespace(&mut self) -> Result<()> {
        let (name, items) = self.current.take().ok_or(Error::NoOpenNamespace)?;
        if !items.is_empty() {
            self.closed.insert(name, items);
        }
        Ok(())
    }

    /// Encode the response. Fails if a namespace is still open or the estimate was exceeded.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some((open, _)) = self.current {
            return Err(Error::NamespaceStillOpen(open));
        }

        let mut buf = Vec::with_capacity(self.estimate);
        let mut writer = MapWriter::new(&mut buf);
        writer.map(self.closed.len())?;
        for (namespace, items) in &self.closed {
            writer.key(namespace)?;
            writer.map(items.len())?;
            for (name, value) in items {
                writer.key(name)?;
                writer.encoded_value(value)?;
            }
        }

        if buf.len() > self.estimate {
            return Err(Error::BudgetExceeded {
                estimate: self.estimate,
                actual: buf.len(),
            });
        }
        Ok(buf)
    }
}
