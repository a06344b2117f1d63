//! Access control profiles and their evaluation against one session's authentication context.
//!
//! A profile may require user authentication, reader authentication, both, or neither.
//! Within a profile every requirement must hold; across the profiles listed for an entry,
//! any one authorized profile releases the entry.
use crate::cbor;
use crate::cose::sign1::{self, VerificationKey};
use crate::credential::cipher;
use crate::credential::{self, StorageKey};
use crate::definitions::helpers::ByteStr;
use coset::CoseSign1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use x509_cert::der::Decode;
use x509_cert::Certificate;

pub type ProfileId = i32;

/// The policy half of a profile, as chosen at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlProfile {
    pub id: ProfileId,
    /// DER-encoded X.509 certificate of the reader allowed through this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_certificate: Option<ByteStr>,
    pub user_authentication_required: bool,
    /// How long a user authentication stays valid. Zero requires a fresh authentication
    /// bound to the session's challenge.
    pub timeout_millis: u64,
    pub secure_user_id: u64,
}

/// A profile sealed with the credential's storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureAccessControlProfile {
    pub profile: AccessControlProfile,
    /// `nonce || tag` of AES-128-GCM over an empty plaintext, AAD = CBOR of `profile`.
    pub mac: ByteStr,
}

impl AccessControlProfile {
    pub fn no_auth(id: ProfileId) -> Self {
        Self {
            id,
            reader_certificate: None,
            user_authentication_required: false,
            timeout_millis: 0,
            secure_user_id: 0,
        }
    }

    pub fn user_auth(id: ProfileId, secure_user_id: u64, timeout_millis: u64) -> Self {
        Self {
            user_authentication_required: true,
            timeout_millis,
            secure_user_id,
            ..Self::no_auth(id)
        }
    }

    pub fn reader_auth(id: ProfileId, reader_certificate_der: Vec<u8>) -> Self {
        Self {
            reader_certificate: Some(reader_certificate_der.into()),
            ..Self::no_auth(id)
        }
    }

    /// Like [reader_auth](Self::reader_auth), from a PEM `CERTIFICATE` block.
    pub fn reader_auth_pem(id: ProfileId, pem: &str) -> Result<Self, credential::Error> {
        let (label, der) = pem_rfc7468::decode_vec(pem.as_bytes())
            .map_err(|_| credential::Error::MalformedProfile(id, "reader certificate is not PEM"))?;
        if label != "CERTIFICATE" {
            return Err(credential::Error::MalformedProfile(
                id,
                "PEM block is not a certificate",
            ));
        }
        Ok(Self::reader_auth(id, der))
    }

    pub fn requires_authentication(&self) -> bool {
        self.user_authentication_required || self.reader_certificate.is_some()
    }

    pub fn seal(
        self,
        storage_key: &StorageKey,
    ) -> Result<SecureAccessControlProfile, credential::Error> {
        let aad = cbor::to_vec(&self).map_err(credential::Error::Encoding)?;
        let mac = cipher::encrypt(storage_key, &[], &aad)?;
        Ok(SecureAccessControlProfile {
            profile: self,
            mac: mac.into(),
        })
    }
}

impl SecureAccessControlProfile {
    pub fn id(&self) -> ProfileId {
        self.profile.id
    }

    /// Whether this profile was sealed with `storage_key` and left untouched since.
    pub fn verify_mac(&self, storage_key: &StorageKey) -> bool {
        let Ok(aad) = cbor::to_vec(&self.profile) else {
            return false;
        };
        matches!(
            cipher::decrypt(storage_key, self.mac.as_ref(), &aad),
            Ok(plaintext) if plaintext.is_empty()
        )
    }
}

/// Proof of a recent user authentication, minted by a trusted authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareAuthToken {
    pub challenge: i64,
    pub user_id: u64,
    pub authenticator_id: u64,
    /// Zero means no authenticator vouched for this token.
    pub authenticator_type: u32,
    pub timestamp_millis: u64,
}

pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        u64::try_from(millis).unwrap_or_default()
    }
}

/// A clock that never moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

/// The reader's signature together with the bytes it must cover.
#[derive(Debug, Clone)]
pub struct ReaderAuthentication {
    pub signature: CoseSign1,
    pub reader_authentication_bytes: Vec<u8>,
}

/// Everything a profile can be evaluated against, fixed at `startRetrieval`.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub auth_challenge: Option<i64>,
    pub auth_token: Option<HardwareAuthToken>,
    pub reader_authentication: Option<ReaderAuthentication>,
    pub now_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AccessDenial {
    UserAuthenticationFailed,
    ReaderAuthenticationFailed,
    NotInRequestMessage,
    NoAccessControlProfiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Authorized,
    Denied(AccessDenial),
}

impl AccessCheck {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AccessCheck::Authorized)
    }
}

pub fn evaluate(profile: &AccessControlProfile, context: &AuthContext) -> AccessCheck {
    if profile.user_authentication_required && !user_authenticated(profile, context) {
        return AccessCheck::Denied(AccessDenial::UserAuthenticationFailed);
    }
    if let Some(certificate) = &profile.reader_certificate {
        if !reader_authenticated(profile.id, certificate.as_ref(), context) {
            return AccessCheck::Denied(AccessDenial::ReaderAuthenticationFailed);
        }
    }
    AccessCheck::Authorized
}

fn user_authenticated(profile: &AccessControlProfile, context: &AuthContext) -> bool {
    let (Some(token), Some(challenge)) = (&context.auth_token, context.auth_challenge) else {
        return false;
    };
    if token.authenticator_type == 0 || token.user_id != profile.secure_user_id {
        return false;
    }
    if token.challenge != challenge {
        return false;
    }
    if profile.timeout_millis > 0 {
        if token.timestamp_millis > context.now_millis {
            return false;
        }
        if context.now_millis - token.timestamp_millis > profile.timeout_millis {
            return false;
        }
    }
    true
}

fn reader_authenticated(id: ProfileId, certificate: &[u8], context: &AuthContext) -> bool {
    let Some(reader) = &context.reader_authentication else {
        return false;
    };
    let key = match reader_public_key(certificate) {
        Ok(key) => key,
        Err(reason) => {
            tracing::warn!(profile = id, reason, "unusable reader certificate");
            return false;
        }
    };
    sign1::verify_detached(&reader.signature, &reader.reader_authentication_bytes, &key).is_ok()
}

/// Subject public key of a DER X.509 certificate.
pub fn reader_public_key(certificate_der: &[u8]) -> Result<VerificationKey, &'static str> {
    let certificate =
        Certificate::from_der(certificate_der).map_err(|_| "certificate is not valid DER")?;
    let public_key = certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or("subject public key has unused bits")?;
    VerificationKey::from_sec1_bytes(public_key)
        .map_err(|_| "subject public key is not P-256 or P-384")
}

/// Per-session memo of profile evaluations. Profiles are evaluated on first use only.
#[derive(Debug, Default)]
pub struct AccessControlCache {
    profiles: BTreeMap<ProfileId, AccessControlProfile>,
    results: BTreeMap<ProfileId, AccessCheck>,
}

impl AccessControlCache {
    pub fn new(profiles: BTreeMap<ProfileId, AccessControlProfile>) -> Self {
        Self {
            profiles,
            results: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: ProfileId) -> bool {
        self.profiles.contains_key(&id)
    }

    pub fn is_evaluated(&self, id: ProfileId) -> bool {
        self.results.contains_key(&id)
    }

    /// `None` if no profile with this ID was supplied.
    pub fn check(&mut self, id: ProfileId, context: &AuthContext) -> Option<AccessCheck> {
        if let Some(result) = self.results.get(&id) {
            return Some(*result);
        }
        let result = evaluate(self.profiles.get(&id)?, context);
        tracing::debug!(profile = id, ?result, "evaluated access control profile");
        self.results.insert(id, result);
        Some(result)
    }

    /// Authorized if any listed profile is. Otherwise the denial of the last profile checked.
    pub fn check_any(&mut self, ids: &[ProfileId], context: &AuthContext) -> AccessCheck {
        let mut outcome = AccessCheck::Denied(AccessDenial::NoAccessControlProfiles);
        for id in ids {
            match self.check(*id, context) {
                Some(AccessCheck::Authorized) => return AccessCheck::Authorized,
                Some(denied) => outcome = denied,
                None => {}
            }
        }
        outcome
    }
}
