use super::{EntryAccess, Error, IdentityCredentialApi, Result, RetrievalParameters};
use crate::access_control::{
    AccessCheck, AccessControlCache, AccessControlProfile, AccessDenial, AuthContext, Clock,
    ProfileId, ReaderAuthentication, SystemClock,
};
use crate::cbor;
use crate::cose::{mac0, sign1};
use crate::credential::{cipher, entry_additional_data, CredentialRecord, HardwareBoundKey};
use crate::definitions::device_namespaces::{estimate_size, DeviceNamespacesBuilder};
use crate::definitions::device_request::{ItemsRequest, ItemsRequestBytes, RequestNamespace};
use crate::definitions::session::{
    create_p256_ephemeral_keys, encode_public_key, get_shared_secret, EDeviceKey,
    SessionTranscriptBinder,
};
use ciborium::Value;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use signature::Signer;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, UNIX_EPOCH};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::UtcTime;
use x509_cert::der::Encode;
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::name::Name;
use x509_cert::spki::{SignatureBitStringEncoding, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use zeroize::Zeroizing;

/// Where a session is in the retrieval protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
pub enum State {
    #[default]
    Uninitialized,
    Initialized,
    EphemeralKeyCreated,
    ReaderKeySet,
    ChallengeCreated,
    NamespacesRequested,
    Retrieving,
    Finished,
    /// Invalid data was encountered. Only the side operations remain available.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithholdReason {
    AccessDenied(AccessDenial),
    DecryptionFailed,
}

/// A requested entry that was left out of the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithheldEntry {
    pub namespace: String,
    pub name: String,
    pub reason: WithholdReason,
}

#[derive(Serialize)]
struct ProofOfDeletion<'a>(&'static str, &'a str, bool);

/// An identity credential and the single retrieval session running against it.
///
/// A session cannot be rewound: start over by constructing a new instance.
pub struct IdentityCredential<C = SystemClock> {
    credential_data: Vec<u8>,
    hardware_bound_key: HardwareBoundKey,
    clock: C,
    record: Option<CredentialRecord>,
    state: State,
    session: Session,
}

#[derive(Default)]
struct Session {
    e_device_key: Option<EDeviceKey>,
    e_device_public_key: Option<PublicKey>,
    e_reader_key: Option<PublicKey>,
    auth_challenge: Option<i64>,
    requests: Vec<RequestNamespace>,
    estimate: usize,
    retrieval: Option<Retrieval>,
    withheld: Vec<WithheldEntry>,
}

struct Retrieval {
    access_control: AccessControlCache,
    auth_context: AuthContext,
    transcript: SessionTranscriptBinder,
    items_request: Option<ItemsRequest>,
    signing_key_blob: Vec<u8>,
    builder: DeviceNamespacesBuilder,
    progress: Vec<NamespaceProgress>,
    current_namespace: Option<usize>,
    pending: Option<PendingEntry>,
}

struct NamespaceProgress {
    remaining: usize,
    resolved: BTreeSet<String>,
}

struct PendingEntry {
    namespace_index: usize,
    name: String,
    size: usize,
    additional_data: Vec<u8>,
    plaintext: Vec<u8>,
}

impl IdentityCredential<SystemClock> {
    pub fn new(credential_data: Vec<u8>, hardware_bound_key: HardwareBoundKey) -> Self {
        Self::with_clock(credential_data, hardware_bound_key, SystemClock)
    }
}

impl<C: Clock> IdentityCredential<C> {
    /// Use `clock` to judge whether user authentications are still fresh.
    pub fn with_clock(
        credential_data: Vec<u8>,
        hardware_bound_key: HardwareBoundKey,
        clock: C,
    ) -> Self {
        Self {
            credential_data,
            hardware_bound_key,
            clock,
            record: None,
            state: State::Uninitialized,
            session: Session::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The loaded credential, once `initialize` has succeeded.
    pub fn record(&self) -> Option<&CredentialRecord> {
        self.record.as_ref()
    }

    pub fn auth_challenge(&self) -> Option<i64> {
        self.session.auth_challenge
    }

    /// Upper bound on the size of the `DeviceNameSpaces` this session will produce, known once
    /// namespaces are requested.
    pub fn estimated_response_size(&self) -> Option<usize> {
        match self.state {
            State::NamespacesRequested | State::Retrieving | State::Finished => {
                Some(self.session.estimate)
            }
            _ => None,
        }
    }

    /// Entries resolved so far that will not appear in the response.
    pub fn withheld_entries(&self) -> &[WithheldEntry] {
        &self.session.withheld
    }

    fn transition(&mut self, next: State) {
        tracing::debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
    }

    /// Tear down the session if `result` reports invalid data.
    fn abort_on_invalid_data<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::InvalidData(reason)) = &result {
            tracing::warn!(state = %self.state, %reason, "aborting session");
            self.session = Session::default();
            self.state = State::Aborted;
        }
        result
    }

    fn loaded_record(&self) -> Result<&CredentialRecord> {
        self.record
            .as_ref()
            .ok_or(Error::OrderViolation("credential is not initialized"))
    }

    fn expect_state(&self, allowed: &[State], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            tracing::debug!(state = %self.state, operation, "rejected out-of-order call");
            Err(Error::OrderViolation(operation))
        }
    }

    fn try_set_reader_ephemeral_public_key(&mut self, public_key: &[u8]) -> Result<()> {
        self.expect_state(
            &[State::EphemeralKeyCreated],
            "reader key must follow the device key and precede the challenge",
        )?;
        let reader_key = PublicKey::from_sec1_bytes(public_key)
            .map_err(|_| Error::InvalidData("reader ephemeral key is not a P-256 point".into()))?;
        self.session.e_reader_key = Some(reader_key);
        self.transition(State::ReaderKeySet);
        Ok(())
    }

    fn try_set_requested_namespaces(&mut self, requests: Vec<RequestNamespace>) -> Result<()> {
        self.expect_state(
            &[
                State::EphemeralKeyCreated,
                State::ReaderKeySet,
                State::ChallengeCreated,
            ],
            "namespaces must be requested after the ephemeral key is created",
        )?;
        check_requests(self.loaded_record()?, &requests)?;

        self.session.estimate = estimate_size(&requests);
        self.session.requests = requests;
        tracing::debug!(
            namespaces = self.session.requests.len(),
            estimate = self.session.estimate,
            "namespaces requested"
        );
        self.transition(State::NamespacesRequested);
        Ok(())
    }

    fn try_start_retrieval(&mut self, parameters: RetrievalParameters) -> Result<()> {
        self.expect_state(
            &[State::NamespacesRequested],
            "retrieval must start once, after namespaces are requested",
        )?;
        let RetrievalParameters {
            access_control_profiles,
            auth_token,
            items_request,
            signing_key_blob,
            session_transcript,
            reader_signature,
            request_counts,
        } = parameters;
        let record = self.loaded_record()?;
        let session = &self.session;

        let mut profiles = BTreeMap::<ProfileId, AccessControlProfile>::new();
        for secure in access_control_profiles {
            if !secure.verify_mac(record.storage_key()) {
                return Err(Error::InvalidData(format!(
                    "access control profile {} failed its integrity check",
                    secure.id()
                )));
            }
            let id = secure.id();
            if profiles.insert(id, secure.profile).is_some() {
                return Err(Error::InvalidData(format!(
                    "access control profile {id} supplied twice"
                )));
            }
        }
        let referenced: BTreeSet<ProfileId> = session
            .requests
            .iter()
            .flat_map(|request| &request.items)
            .flat_map(|item| item.access_control_profile_ids.iter().copied())
            .collect();
        if let Some(missing) = referenced.iter().find(|id| !profiles.contains_key(*id)) {
            return Err(Error::InvalidData(format!(
                "access control profile {missing} is referenced but was not supplied"
            )));
        }

        if request_counts.len() != session.requests.len()
            || request_counts
                .iter()
                .zip(&session.requests)
                .any(|(count, request)| *count != request.items.len())
        {
            return Err(Error::InvalidData(
                "request counts do not match the requested namespaces".into(),
            ));
        }

        let transcript = SessionTranscriptBinder::new(session_transcript)?;
        if !transcript.is_empty() {
            let e_device_public_key = session
                .e_device_public_key
                .as_ref()
                .ok_or(Error::EphemeralKeyNotFound)?;
            if !transcript.contains_ephemeral_key(e_device_public_key) {
                return Err(Error::EphemeralKeyNotFound);
            }
        }

        let parsed_items_request = if items_request.is_empty() {
            None
        } else {
            let parsed = ItemsRequest::from_slice(&items_request)?;
            if parsed.doc_type != record.doc_type() {
                return Err(Error::InvalidData(format!(
                    "items request is for '{}', credential is '{}'",
                    parsed.doc_type,
                    record.doc_type()
                )));
            }
            Some(parsed)
        };

        let reader_authentication = if reader_signature.is_empty() {
            None
        } else {
            let signature = sign1::from_slice(&reader_signature)
                .map_err(|e| Error::InvalidData(format!("reader signature: {e}")))?;
            if items_request.is_empty() {
                return Err(Error::InvalidData(
                    "reader signature supplied without an items request".into(),
                ));
            }
            let items_request_bytes = ItemsRequestBytes::from_bytes(items_request)
                .map_err(|e| Error::InvalidData(e.to_string()))?;
            Some(ReaderAuthentication {
                signature,
                reader_authentication_bytes: transcript
                    .reader_authentication_bytes(&items_request_bytes)?,
            })
        };

        let auth_context = AuthContext {
            auth_challenge: session.auth_challenge,
            auth_token,
            reader_authentication,
            now_millis: self.clock.now_millis(),
        };
        let mut access_control = AccessControlCache::new(profiles);
        for id in &referenced {
            if let Some(AccessCheck::Denied(reason)) = access_control.check(*id, &auth_context) {
                tracing::warn!(profile = id, %reason, "access control profile not satisfied");
            }
        }

        let progress = request_counts
            .into_iter()
            .map(|remaining| NamespaceProgress {
                remaining,
                resolved: BTreeSet::new(),
            })
            .collect();
        self.session.retrieval = Some(Retrieval {
            access_control,
            auth_context,
            transcript,
            items_request: parsed_items_request,
            signing_key_blob,
            builder: DeviceNamespacesBuilder::new(self.session.estimate),
            progress,
            current_namespace: None,
            pending: None,
        });
        self.transition(State::Retrieving);
        Ok(())
    }

    fn try_start_retrieve_entry_value(
        &mut self,
        namespace: &str,
        name: &str,
        entry_size: u64,
        access_control_profile_ids: &[ProfileId],
    ) -> Result<EntryAccess> {
        self.expect_state(&[State::Retrieving], "retrieval has not started")?;
        let Session {
            requests,
            retrieval,
            withheld,
            ..
        } = &mut self.session;
        let retrieval = retrieval
            .as_mut()
            .ok_or(Error::OrderViolation("retrieval has not started"))?;
        if retrieval.pending.is_some() {
            return Err(Error::OrderViolation(
                "previous entry has not been fully retrieved",
            ));
        }

        let index = requests
            .iter()
            .position(|request| request.namespace_name == namespace)
            .ok_or_else(|| {
                Error::InvalidData(format!("namespace '{namespace}' was not requested"))
            })?;
        if retrieval.progress[index].remaining == 0 {
            return Err(Error::InvalidData(format!(
                "every entry of namespace '{namespace}' was already retrieved"
            )));
        }
        match retrieval.current_namespace {
            Some(current) if current == index => {}
            Some(_) => {
                return Err(Error::OrderViolation(
                    "current namespace still has entries to retrieve",
                ))
            }
            None => {
                let next = retrieval
                    .progress
                    .iter()
                    .position(|progress| progress.remaining > 0);
                if next != Some(index) {
                    return Err(Error::OrderViolation(
                        "namespaces must be retrieved in request order",
                    ));
                }
            }
        }

        let item = requests[index]
            .items
            .iter()
            .find(|item| item.name == name)
            .ok_or_else(|| {
                Error::InvalidData(format!("entry '{namespace}/{name}' was not requested"))
            })?;
        if retrieval.progress[index].resolved.contains(name) {
            return Err(Error::InvalidData(format!(
                "entry '{namespace}/{name}' was already retrieved"
            )));
        }
        if item.size != entry_size || item.access_control_profile_ids != access_control_profile_ids
        {
            return Err(Error::InvalidData(format!(
                "entry '{namespace}/{name}' does not match its request"
            )));
        }

        if retrieval.current_namespace.is_none() {
            retrieval.builder.open_namespace(namespace)?;
            retrieval.current_namespace = Some(index);
        }

        let access = match &retrieval.items_request {
            Some(items_request) if !items_request.contains(namespace, name) => {
                AccessCheck::Denied(AccessDenial::NotInRequestMessage)
            }
            _ => retrieval
                .access_control
                .check_any(access_control_profile_ids, &retrieval.auth_context),
        };

        match access {
            AccessCheck::Authorized => {
                let size = usize::try_from(entry_size)
                    .map_err(|_| Error::InvalidData("entry size does not fit in memory".into()))?;
                retrieval.pending = Some(PendingEntry {
                    namespace_index: index,
                    name: name.to_string(),
                    size,
                    additional_data: entry_additional_data(
                        namespace,
                        name,
                        access_control_profile_ids,
                    )?,
                    plaintext: Vec::with_capacity(size),
                });
                Ok(EntryAccess::Granted)
            }
            AccessCheck::Denied(reason) => {
                tracing::warn!(namespace, name, %reason, "withholding entry");
                withheld.push(WithheldEntry {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    reason: WithholdReason::AccessDenied(reason),
                });
                retrieval.resolve(index, name)?;
                Ok(EntryAccess::Withheld(reason))
            }
        }
    }

    fn try_retrieve_entry_value(&mut self, encrypted_chunk: &[u8]) -> Result<Vec<u8>> {
        self.expect_state(&[State::Retrieving], "retrieval has not started")?;
        let record = self
            .record
            .as_ref()
            .ok_or(Error::OrderViolation("credential is not initialized"))?;
        let Session {
            requests,
            retrieval,
            withheld,
            ..
        } = &mut self.session;
        let retrieval = retrieval
            .as_mut()
            .ok_or(Error::OrderViolation("retrieval has not started"))?;
        let pending = retrieval
            .pending
            .as_mut()
            .ok_or(Error::OrderViolation("no entry is being retrieved"))?;

        let chunk = match cipher::decrypt(
            record.storage_key(),
            encrypted_chunk,
            &pending.additional_data,
        ) {
            Ok(chunk) => chunk,
            Err(e) => {
                let namespace = requests[pending.namespace_index].namespace_name.clone();
                let index = pending.namespace_index;
                let name = pending.name.clone();
                tracing::warn!(
                    %namespace,
                    %name,
                    "entry chunk failed to decrypt, withholding entry"
                );
                retrieval.pending = None;
                withheld.push(WithheldEntry {
                    namespace,
                    name: name.clone(),
                    reason: WithholdReason::DecryptionFailed,
                });
                retrieval.resolve(index, &name)?;
                return Err(Error::Crypto(e.to_string()));
            }
        };

        if pending.plaintext.len() + chunk.len() > pending.size {
            return Err(Error::InvalidData(format!(
                "entry '{}' is longer than its declared {} bytes",
                pending.name, pending.size
            )));
        }
        pending.plaintext.extend_from_slice(&chunk);

        if pending.plaintext.len() == pending.size {
            if let Some(done) = retrieval.pending.take() {
                cbor::from_slice::<Value>(&done.plaintext).map_err(|e| {
                    Error::InvalidData(format!("entry '{}' is not one CBOR item: {e}", done.name))
                })?;
                retrieval.builder.append(&done.name, done.plaintext)?;
                retrieval.resolve(done.namespace_index, &done.name)?;
            }
        }
        Ok(chunk)
    }

    fn try_finish_retrieval(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.expect_state(&[State::Retrieving], "retrieval has not started")?;
        let session = &mut self.session;
        let Some(retrieval) = session.retrieval.as_ref() else {
            return Err(Error::OrderViolation("retrieval has not started"));
        };
        if retrieval.pending.is_some()
            || retrieval.progress.iter().any(|progress| progress.remaining > 0)
        {
            return Err(Error::OrderViolation(
                "not every requested entry has been resolved",
            ));
        }
        if session.e_reader_key.is_none() && retrieval.signing_key_blob.is_empty() {
            return Err(Error::SigningKeyNotFound);
        }
        let Some(retrieval) = session.retrieval.take() else {
            return Err(Error::OrderViolation("retrieval has not started"));
        };

        // The retrieval is gone, so any failure from here on ends the session.
        let response = self.loaded_record().and_then(|record| {
            authenticate_response(
                record,
                self.session.e_reader_key.as_ref(),
                self.session.e_device_key.as_ref(),
                retrieval,
            )
        });
        let (tag, device_namespaces) = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "unable to authenticate response, aborting session");
                self.session = Session::default();
                self.state = State::Aborted;
                return Err(e);
            }
        };

        tracing::debug!(
            response_len = device_namespaces.len(),
            estimate = self.session.estimate,
            withheld = self.session.withheld.len(),
            "retrieval finished"
        );
        self.transition(State::Finished);
        Ok((tag, device_namespaces))
    }
}

/// Encode the response and authenticate it: MAC it when the reader supplied an ephemeral key,
/// sign it with the unsealed signing key otherwise. Returns the tag and the `DeviceNameSpaces`.
fn authenticate_response(
    record: &CredentialRecord,
    e_reader_key: Option<&PublicKey>,
    e_device_key: Option<&EDeviceKey>,
    retrieval: Retrieval,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let device_namespaces = retrieval.builder.finish()?;
    let payload = retrieval
        .transcript
        .device_authentication_bytes(record.doc_type(), &device_namespaces)?;

    let tag = match (e_reader_key, e_device_key) {
        (Some(e_reader_key), Some(e_device_key)) => {
            let shared_secret = get_shared_secret(e_reader_key, e_device_key);
            let emac_key = Zeroizing::new(retrieval.transcript.derive_emac_key(&shared_secret)?);
            mac0::to_vec(mac0::mac_detached(&emac_key[..], &payload)?)?
        }
        (Some(_), None) => return Err(Error::EphemeralKeyNotFound),
        (None, _) => {
            let scalar = Zeroizing::new(
                cipher::decrypt(
                    record.storage_key(),
                    &retrieval.signing_key_blob,
                    record.doc_type().as_bytes(),
                )
                .map_err(|_| Error::InvalidData("signing key blob does not decrypt".into()))?,
            );
            let signing_key = SigningKey::from_slice(&scalar)
                .map_err(|_| Error::InvalidData("signing key blob is not a P-256 key".into()))?;
            sign1::to_vec(sign1::sign_detached(&signing_key, &payload)?)?
        }
    };
    Ok((tag, device_namespaces))
}

/// Requested entries must exist in the credential exactly as declared, each once.
fn check_requests(record: &CredentialRecord, requests: &[RequestNamespace]) -> Result<()> {
    let mut seen_namespaces = BTreeSet::new();
    for request in requests {
        let namespace = &request.namespace_name;
        if !seen_namespaces.insert(namespace.as_str()) {
            return Err(Error::InvalidData(format!(
                "namespace '{namespace}' requested twice"
            )));
        }
        let mut seen_names = BTreeSet::new();
        for item in &request.items {
            if !seen_names.insert(item.name.as_str()) {
                return Err(Error::InvalidData(format!(
                    "entry '{namespace}/{}' requested twice",
                    item.name
                )));
            }
            let entry = record.entry(namespace, &item.name).ok_or_else(|| {
                Error::InvalidData(format!(
                    "entry '{namespace}/{}' is not in the credential",
                    item.name
                ))
            })?;
            if entry.size != item.size
                || entry.access_control_profile_ids != item.access_control_profile_ids
            {
                return Err(Error::InvalidData(format!(
                    "entry '{namespace}/{}' does not match the credential",
                    item.name
                )));
            }
        }
    }
    Ok(())
}

impl Retrieval {
    /// Mark an entry done, closing its namespace when nothing is left in it.
    fn resolve(&mut self, index: usize, name: &str) -> Result<()> {
        let progress = &mut self.progress[index];
        progress.resolved.insert(name.to_string());
        progress.remaining -= 1;
        if progress.remaining == 0 {
            self.builder.close_namespace()?;
            self.current_namespace = None;
        }
        Ok(())
    }
}

impl<C: Clock> IdentityCredentialApi for IdentityCredential<C> {
    fn initialize(&mut self) -> Result<()> {
        self.expect_state(&[State::Uninitialized], "credential is already initialized")?;
        let record = CredentialRecord::load(&self.credential_data, &self.hardware_bound_key)
            .map_err(|e| {
                tracing::warn!(error = %e, "unable to load credential");
                Error::from(e)
            })?;
        tracing::debug!(
            doc_type = record.doc_type(),
            test_credential = record.is_test_credential(),
            "credential loaded"
        );
        self.record = Some(record);
        self.transition(State::Initialized);
        Ok(())
    }

    fn create_ephemeral_key_pair(&mut self) -> Result<Vec<u8>> {
        self.expect_state(
            &[State::Initialized],
            "ephemeral key must be created once, right after initialize",
        )?;
        let (e_device_key, e_device_public_key) = create_p256_ephemeral_keys();
        let encoded = encode_public_key(&e_device_public_key);
        self.session.e_device_key = Some(e_device_key);
        self.session.e_device_public_key = Some(e_device_public_key);
        self.transition(State::EphemeralKeyCreated);
        Ok(encoded)
    }

    fn set_reader_ephemeral_public_key(&mut self, public_key: &[u8]) -> Result<()> {
        let result = self.try_set_reader_ephemeral_public_key(public_key);
        self.abort_on_invalid_data(result)
    }

    fn create_auth_challenge(&mut self) -> Result<i64> {
        self.expect_state(
            &[State::EphemeralKeyCreated, State::ReaderKeySet],
            "challenge must be created once, before namespaces are requested",
        )?;
        let challenge = loop {
            let candidate: i64 = OsRng.gen();
            if candidate != 0 {
                break candidate;
            }
        };
        self.session.auth_challenge = Some(challenge);
        self.transition(State::ChallengeCreated);
        Ok(challenge)
    }

    fn set_requested_namespaces(&mut self, requests: Vec<RequestNamespace>) -> Result<()> {
        let result = self.try_set_requested_namespaces(requests);
        self.abort_on_invalid_data(result)
    }

    fn start_retrieval(&mut self, parameters: RetrievalParameters) -> Result<()> {
        let result = self.try_start_retrieval(parameters);
        self.abort_on_invalid_data(result)
    }

    fn start_retrieve_entry_value(
        &mut self,
        namespace: &str,
        name: &str,
        entry_size: u64,
        access_control_profile_ids: &[ProfileId],
    ) -> Result<EntryAccess> {
        let result = self.try_start_retrieve_entry_value(
            namespace,
            name,
            entry_size,
            access_control_profile_ids,
        );
        self.abort_on_invalid_data(result)
    }

    fn retrieve_entry_value(&mut self, encrypted_chunk: &[u8]) -> Result<Vec<u8>> {
        let result = self.try_retrieve_entry_value(encrypted_chunk);
        self.abort_on_invalid_data(result)
    }

    fn finish_retrieval(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let result = self.try_finish_retrieval();
        self.abort_on_invalid_data(result)
    }

    fn delete_credential(&mut self) -> Result<Vec<u8>> {
        let record = self.loaded_record()?;
        let payload = cbor::to_vec(&ProofOfDeletion(
            "ProofOfDeletion",
            record.doc_type(),
            record.is_test_credential(),
        ))?;
        let proof = sign1::sign_attached(&record.credential_signing_key(), payload)?;
        tracing::debug!(doc_type = record.doc_type(), "produced proof of deletion");
        Ok(sign1::to_vec(proof)?)
    }

    fn generate_signing_key_pair(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let record = self.loaded_record()?;
        let signing_key = SigningKey::random(&mut OsRng);
        let scalar = Zeroizing::new(signing_key.to_bytes().to_vec());
        let key_blob = cipher::encrypt(record.storage_key(), &scalar, record.doc_type().as_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let certificate = signing_key_certificate(
            &record.credential_signing_key(),
            signing_key.verifying_key(),
            self.clock.now_millis(),
        )?;
        Ok((key_blob, certificate))
    }
}

const CERTIFICATE_ISSUER: &str = "CN=Identity Credential Key";
const CERTIFICATE_SUBJECT: &str = "CN=Identity Credential Authentication Key";
const CERTIFICATE_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// DER X.509 certificate for `subject_key`, issued and signed by the credential key.
fn signing_key_certificate(
    credential_key: &SigningKey,
    subject_key: &VerifyingKey,
    now_millis: u64,
) -> Result<Vec<u8>> {
    let not_before = UNIX_EPOCH + Duration::from_millis(now_millis);
    let validity = Validity {
        not_before: Time::UtcTime(
            UtcTime::from_system_time(not_before).map_err(certificate_error)?,
        ),
        not_after: Time::UtcTime(
            UtcTime::from_system_time(not_before + CERTIFICATE_VALIDITY)
                .map_err(certificate_error)?,
        ),
    };
    let issuer: Name = CERTIFICATE_ISSUER.parse().map_err(certificate_error)?;
    let subject: Name = CERTIFICATE_SUBJECT.parse().map_err(certificate_error)?;
    let spki = SubjectPublicKeyInfoOwned::from_key(*subject_key).map_err(certificate_error)?;

    let mut builder = CertificateBuilder::new(
        Profile::Manual {
            issuer: Some(issuer),
        },
        rand::random::<u64>().into(),
        validity,
        subject,
        spki,
        credential_key,
    )
    .map_err(certificate_error)?;
    builder
        .add_extension(&KeyUsage(KeyUsages::DigitalSignature.into()))
        .map_err(certificate_error)?;

    let tbs_certificate = builder.finalize().map_err(certificate_error)?;
    let signature: p256::ecdsa::Signature = credential_key
        .try_sign(&tbs_certificate)
        .map_err(certificate_error)?;
    let signature = signature.to_der().to_bitstring().map_err(certificate_error)?;
    builder
        .assemble(signature)
        .map_err(certificate_error)?
        .to_der()
        .map_err(certificate_error)
}

fn certificate_error(e: impl std::fmt::Display) -> Error {
    Error::Crypto(format!("unable to issue signing key certificate: {e}"))
}
