//! What the caller asks the credential to release.
//!
//! [RequestNamespace] is the caller-facing request handed to
//! [set_requested_namespaces](crate::presentation::IdentityCredentialApi::set_requested_namespaces).
//! [ItemsRequest] is the reader's own CBOR request, which the reader signs and which the
//! session only uses to double-check what the reader actually asked for.
use crate::cbor::{self, CborError};
use crate::definitions::helpers::{NonEmptyMap, Tag24};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ItemsRequestBytes = Tag24<ItemsRequest>;
pub type DocType = String;
pub type NameSpace = String;
pub type IntentToRetain = bool;
pub type DataElementIdentifier = String;
pub type DataElements = NonEmptyMap<DataElementIdentifier, IntentToRetain>;
pub type Namespaces = NonEmptyMap<NameSpace, DataElements>;
pub type AccessControlProfileId = i32;

/// A namespace and the entries wanted from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNamespace {
    pub namespace_name: NameSpace,
    pub items: Vec<RequestDataItem>,
}

/// A single requested entry.
///
/// `size` is the plaintext size declared at provisioning time and `access_control_profile_ids`
/// lists the profiles of which any one is sufficient to release the entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDataItem {
    pub name: DataElementIdentifier,
    pub size: u64,
    pub access_control_profile_ids: Vec<AccessControlProfileId>,
}

impl RequestNamespace {
    pub fn new(namespace_name: impl Into<String>) -> Self {
        Self {
            namespace_name: namespace_name.into(),
            items: Vec::new(),
        }
    }

    pub fn item(
        mut self,
        name: impl Into<String>,
        size: u64,
        access_control_profile_ids: Vec<AccessControlProfileId>,
    ) -> Self {
        self.items.push(RequestDataItem {
            name: name.into(),
            size,
            access_control_profile_ids,
        });
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    pub doc_type: DocType,
    #[serde(rename = "nameSpaces")]
    pub namespaces: Namespaces,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<BTreeMap<String, ciborium::Value>>,
}

impl ItemsRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CborError> {
        cbor::from_slice(bytes)
    }

    /// Whether the reader listed `name` under `namespace`.
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.namespaces
            .get(namespace)
            .map(|elements| elements.contains_key(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn items_request() {
        const HEX: &str = "D8185868A267646F6354797065756F72672E69736F2E31383031332E352E312E6D444C6A6E616D65537061636573A1716F72672E69736F2E31383031332E352E31A36B66616D696C795F6E616D65F46A676976656E5F6E616D65F46F646F63756D656E745F6E756D626572F4";
        let bytes: Vec<u8> = hex::decode(HEX).unwrap();
        let req: Tag24<ItemsRequest> = cbor::from_slice(&bytes).unwrap();
        let roundtripped = cbor::to_vec(&req).unwrap();
        assert_eq!(bytes, roundtripped);

        let req = req.into_inner();
        assert_eq!(req.doc_type, "org.iso.18013.5.1.mDL");
        assert!(req.contains("org.iso.18013.5.1", "family_name"));
        assert!(!req.contains("org.iso.18013.5.1", "portrait"));
        assert!(!req.contains("org.iso.18013.5.1.aamva", "family_name"));
    }
}
