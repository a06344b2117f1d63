use anyhow::Result;
use ciborium::Value;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use identity_credential::access_control::{
    AccessControlProfile, AccessDenial, FixedClock, HardwareAuthToken,
};
use identity_credential::cose::sign1;
use identity_credential::credential::CredentialBuilder;
use identity_credential::definitions::device_request::RequestNamespace;
use identity_credential::presentation::{
    EntryAccess, Error, IdentityCredential, IdentityCredentialApi, RetrievalParameters, State,
    WithholdReason,
};

mod common;
use common::*;

#[test]
fn single_entry_is_released_and_signed() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    let (signing_key_blob, certificate) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: vec![1],
        ..Default::default()
    })?;

    let chunks = encrypted_chunks(&credential, "ns", "name")?;
    assert_eq!(
        credential.start_retrieve_entry_value("ns", "name", 6, &[0])?,
        EntryAccess::Granted
    );
    let plaintext = credential.retrieve_entry_value(&chunks[0])?;
    assert_eq!(decode(&plaintext), text("value"));

    let (signature, device_namespaces) = credential.finish_retrieval()?;
    assert_eq!(
        device_namespaces,
        hex::decode("a1626e73a1646e616d656576616c7565")?
    );
    assert_eq!(credential.state(), State::Finished);

    let signing_key = certified_key(&provisioned.credential_public_key, &certificate)?;
    let payload = device_authentication_bytes(&Value::Null, DOC_TYPE, &device_namespaces);
    sign1::verify_detached(&sign1::from_slice(&signature)?, &payload, &signing_key)?;
    Ok(())
}

#[test]
fn unauthenticated_user_gets_nothing() -> Result<()> {
    let builder = CredentialBuilder::new(DOC_TYPE)
        .access_control_profile(AccessControlProfile::user_auth(0, 7, 0))
        .entry("ns", "name", text("value"), vec![0]);
    let (mut credential, provisioned) = provision(builder)?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: vec![1],
        ..Default::default()
    })?;

    assert_eq!(
        credential.start_retrieve_entry_value("ns", "name", 6, &[0])?,
        EntryAccess::Withheld(AccessDenial::UserAuthenticationFailed)
    );
    let (_, device_namespaces) = credential.finish_retrieval()?;
    assert_eq!(device_namespaces, vec![0xa0]);
    assert_eq!(
        credential.withheld_entries()[0].reason,
        WithholdReason::AccessDenied(AccessDenial::UserAuthenticationFailed)
    );
    Ok(())
}

/// Run a full signature-authenticated retrieval of every entry in `requests`.
fn retrieve_everything(
    builder: CredentialBuilder,
    requests: Vec<RequestNamespace>,
) -> Result<(Vec<u8>, usize)> {
    let (mut credential, provisioned) = provision(builder)?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(requests.clone())?;
    let estimate = credential.estimated_response_size().unwrap_or_default();
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: requests.iter().map(|request| request.items.len()).collect(),
        ..Default::default()
    })?;
    for request in &requests {
        for item in &request.items {
            retrieve(
                &mut credential,
                &request.namespace_name,
                &item.name,
                &item.access_control_profile_ids,
            )?;
        }
    }
    let (_, device_namespaces) = credential.finish_retrieval()?;
    Ok((device_namespaces, estimate))
}

#[test]
fn chunking_does_not_change_the_result() -> Result<()> {
    let portrait = Value::Bytes((0..=255).cycle().take(1000).collect());
    let credential = |chunk_size| {
        CredentialBuilder::new(DOC_TYPE)
            .chunk_size(chunk_size)
            .access_control_profile(AccessControlProfile::no_auth(0))
            .entry("ns", "portrait", portrait.clone(), vec![0])
    };
    let size = encode(&portrait).len() as u64;
    let requests = vec![RequestNamespace::new("ns").item("portrait", size, vec![0])];

    let (whole, _) = retrieve_everything(credential(4096), requests.clone())?;
    for chunk_size in [1, 7, 100, 1003] {
        let (chunked, _) = retrieve_everything(credential(chunk_size), requests.clone())?;
        assert_eq!(chunked, whole, "chunk size {chunk_size}");
    }
    Ok(())
}

#[test]
fn estimate_bounds_the_response() -> Result<()> {
    let builder = CredentialBuilder::new(DOC_TYPE)
        .access_control_profile(AccessControlProfile::no_auth(0))
        .access_control_profile(AccessControlProfile::user_auth(1, 7, 0))
        .entry("a", "given_name", text("Erika"), vec![0])
        .entry("a", "family_name", text("Mustermann"), vec![0])
        .entry("a", "portrait", Value::Bytes(vec![0; 300]), vec![1])
        .entry("b", "age", Value::Integer(42.into()), vec![1])
        .entry("b", "over_18", Value::Bool(true), vec![0, 1]);
    let requests = vec![
        RequestNamespace::new("b")
            .item("over_18", 1, vec![0, 1])
            .item("age", 2, vec![1]),
        RequestNamespace::new("a")
            .item("portrait", 303, vec![1])
            .item("given_name", 6, vec![0])
            .item("family_name", 11, vec![0]),
    ];
    let (device_namespaces, estimate) = retrieve_everything(builder, requests)?;
    assert!(device_namespaces.len() <= estimate);

    let released = decode(&device_namespaces);
    assert_eq!(
        released,
        map(vec![
            (
                "a",
                map(vec![
                    ("family_name", text("Mustermann")),
                    ("given_name", text("Erika")),
                ])
            ),
            ("b", map(vec![("over_18", Value::Bool(true))])),
        ])
    );

    let everything_released = vec![RequestNamespace::new("ns").item("name", 6, vec![0])];
    let (device_namespaces, estimate) = retrieve_everything(single_entry(), everything_released)?;
    assert_eq!(device_namespaces.len(), estimate);
    Ok(())
}

#[test]
fn nothing_works_before_initialize() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    let order_violation =
        |result: Result<(), Error>| matches!(result, Err(Error::OrderViolation(_)));

    assert!(order_violation(credential.create_ephemeral_key_pair().map(drop)));
    assert!(order_violation(credential.set_reader_ephemeral_public_key(&[0x04; 65])));
    assert!(order_violation(credential.create_auth_challenge().map(drop)));
    assert!(order_violation(credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])));
    assert!(order_violation(credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        request_counts: vec![1],
        ..Default::default()
    })));
    assert!(order_violation(
        credential
            .start_retrieve_entry_value("ns", "name", 6, &[0])
            .map(drop)
    ));
    assert!(order_violation(credential.retrieve_entry_value(&[0; 34]).map(drop)));
    assert!(order_violation(credential.finish_retrieval().map(drop)));
    assert!(order_violation(credential.delete_credential().map(drop)));
    assert!(order_violation(credential.generate_signing_key_pair().map(drop)));
    assert_eq!(credential.state(), State::Uninitialized);

    credential.initialize()?;
    assert_eq!(credential.state(), State::Initialized);
    Ok(())
}

#[test]
fn finish_requires_every_entry() -> Result<()> {
    let builder = single_entry().entry("ns", "other", Value::Bool(true), vec![0]);
    let (mut credential, provisioned) = provision(builder)?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![RequestNamespace::new("ns")
        .item("name", 6, vec![0])
        .item("other", 1, vec![0])])?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: vec![2],
        ..Default::default()
    })?;

    retrieve(&mut credential, "ns", "name", &[0])?;
    assert!(matches!(
        credential.finish_retrieval(),
        Err(Error::OrderViolation(_))
    ));
    assert_eq!(credential.state(), State::Retrieving);

    retrieve(&mut credential, "ns", "other", &[0])?;
    let (_, device_namespaces) = credential.finish_retrieval()?;
    assert_eq!(
        decode(&device_namespaces),
        map(vec![(
            "ns",
            map(vec![("name", text("value")), ("other", Value::Bool(true))])
        )])
    );
    Ok(())
}

#[test]
fn mac_is_keyed_to_the_reader() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    credential.initialize()?;
    let device_public_key = credential.create_ephemeral_key_pair()?;
    let reader_secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let reader_public_key = reader_secret.public_key();
    credential.set_reader_ephemeral_public_key(
        p256::EncodedPoint::from(reader_public_key).as_bytes(),
    )?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    let transcript = session_transcript(&device_public_key);
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        session_transcript: encode(&transcript),
        request_counts: vec![1],
        ..Default::default()
    })?;
    retrieve(&mut credential, "ns", "name", &[0])?;
    let (tag, device_namespaces) = credential.finish_retrieval()?;

    let device_public_key = p256::PublicKey::from_sec1_bytes(&device_public_key)?;
    let shared_secret = p256::ecdh::diffie_hellman(
        reader_secret.to_nonzero_scalar(),
        device_public_key.as_affine(),
    );
    let mut emac_key = [0u8; 32];
    Hkdf::<Sha256>::new(
        Some(&transcript_salt(&transcript)[..]),
        shared_secret.raw_secret_bytes(),
    )
    .expand(b"EMacKey", &mut emac_key)
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mac0 = decode(&tag);
    let Value::Array(parts) = mac0 else {
        panic!("COSE_Mac0 is an array");
    };
    assert_eq!(parts[2], Value::Null, "payload is detached");
    let Value::Bytes(protected) = &parts[0] else {
        panic!("protected header is a bstr");
    };
    let Value::Bytes(received) = &parts[3] else {
        panic!("tag is a bstr");
    };

    let mac_structure = encode(&Value::Array(vec![
        text("MAC0"),
        Value::Bytes(protected.clone()),
        Value::Bytes(vec![]),
        Value::Bytes(device_authentication_bytes(&transcript, DOC_TYPE, &device_namespaces)),
    ]));
    let mut mac =
        Hmac::<Sha256>::new_from_slice(&emac_key).map_err(|e| anyhow::anyhow!("{e}"))?;
    mac.update(&mac_structure);
    mac.verify_slice(received)
        .map_err(|_| anyhow::anyhow!("MAC does not verify"))?;
    Ok(())
}

#[test]
fn challenge_binds_tokens_to_their_session() -> Result<()> {
    let builder = || {
        CredentialBuilder::new(DOC_TYPE)
            .access_control_profile(AccessControlProfile::user_auth(0, 7, 0))
            .entry("ns", "name", text("value"), vec![0])
    };

    let run = |token: Option<HardwareAuthToken>| -> Result<(i64, Vec<u8>)> {
        let (mut credential, provisioned) = provision(builder())?;
        credential.initialize()?;
        credential.create_ephemeral_key_pair()?;
        let challenge = credential.create_auth_challenge()?;
        assert_ne!(challenge, 0);
        credential.set_requested_namespaces(vec![
            RequestNamespace::new("ns").item("name", 6, vec![0])
        ])?;
        let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
        let token = token.unwrap_or(HardwareAuthToken {
            challenge,
            user_id: 7,
            authenticator_id: 1,
            authenticator_type: 2,
            timestamp_millis: NOW_MILLIS,
        });
        credential.start_retrieval(RetrievalParameters {
            access_control_profiles: provisioned.access_control_profiles,
            auth_token: Some(token),
            signing_key_blob,
            request_counts: vec![1],
            ..Default::default()
        })?;
        retrieve(&mut credential, "ns", "name", &[0])?;
        let (_, device_namespaces) = credential.finish_retrieval()?;
        Ok((challenge, device_namespaces))
    };

    let (challenge, fresh) = run(None)?;
    assert_eq!(decode(&fresh), map(vec![("ns", map(vec![("name", text("value"))]))]));

    let replayed_token = HardwareAuthToken {
        challenge,
        user_id: 7,
        authenticator_id: 1,
        authenticator_type: 2,
        timestamp_millis: NOW_MILLIS,
    };
    let (other_challenge, replayed) = run(Some(replayed_token))?;
    assert_ne!(other_challenge, challenge);
    assert_eq!(replayed, vec![0xa0]);
    Ok(())
}

#[test]
fn transcript_must_belong_to_this_session() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    credential.initialize()?;
    let device_public_key = credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    let parameters = |transcript: &Value| RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles.clone(),
        signing_key_blob: signing_key_blob.clone(),
        session_transcript: encode(transcript),
        request_counts: vec![1],
        ..Default::default()
    };

    let foreign = session_transcript(&[0x04; 65]);
    assert!(matches!(
        credential.start_retrieval(parameters(&foreign)),
        Err(Error::EphemeralKeyNotFound)
    ));
    assert_eq!(credential.state(), State::NamespacesRequested);

    credential.start_retrieval(parameters(&session_transcript(&device_public_key)))?;
    assert_eq!(credential.state(), State::Retrieving);
    Ok(())
}

#[test]
fn unknown_entries_abort_the_session() -> Result<()> {
    let (mut credential, _) = provision(single_entry())?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    let result = credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("missing", 6, vec![0])
    ]);
    assert!(matches!(result, Err(Error::InvalidData(_))));
    assert_eq!(credential.state(), State::Aborted);
    assert!(matches!(
        credential.set_requested_namespaces(vec![
            RequestNamespace::new("ns").item("name", 6, vec![0])
        ]),
        Err(Error::OrderViolation(_))
    ));
    Ok(())
}

#[test]
fn request_counts_must_match() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    let result = credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        request_counts: vec![2],
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::InvalidData(_))));
    assert_eq!(credential.state(), State::Aborted);
    Ok(())
}

/// Offer `requests` to a fresh session and expect it to abort.
fn assert_request_aborts(requests: Vec<RequestNamespace>) -> Result<()> {
    let (mut credential, _) = provision(single_entry())?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    let result = credential.set_requested_namespaces(requests);
    assert!(matches!(result, Err(Error::InvalidData(_))));
    assert_eq!(credential.state(), State::Aborted);
    Ok(())
}

#[test]
fn namespace_requested_twice_aborts() -> Result<()> {
    assert_request_aborts(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0]),
        RequestNamespace::new("ns").item("name", 6, vec![0]),
    ])
}

#[test]
fn entry_requested_twice_aborts() -> Result<()> {
    assert_request_aborts(vec![RequestNamespace::new("ns")
        .item("name", 6, vec![0])
        .item("name", 6, vec![0])])
}

#[test]
fn request_must_match_the_stored_entry() -> Result<()> {
    assert_request_aborts(vec![RequestNamespace::new("ns").item("name", 7, vec![0])])?;
    assert_request_aborts(vec![RequestNamespace::new("ns").item("name", 6, vec![0, 1])])?;
    assert_request_aborts(vec![RequestNamespace::new("ns").item("name", 6, vec![])])
}

#[test]
fn entry_must_match_its_request() -> Result<()> {
    let mut credential = started_with_two_chunks()?;
    let result = credential.start_retrieve_entry_value("ns", "name", 5, &[0]);
    assert!(matches!(result, Err(Error::InvalidData(_))));
    assert_eq!(credential.state(), State::Aborted);
    assert!(matches!(
        credential.finish_retrieval(),
        Err(Error::OrderViolation(_))
    ));

    let mut credential = started_with_two_chunks()?;
    let result = credential.start_retrieve_entry_value("ns", "name", 6, &[1]);
    assert!(matches!(result, Err(Error::InvalidData(_))));
    assert_eq!(credential.state(), State::Aborted);
    Ok(())
}

/// A session with `ns/name` (6 bytes, two chunks) and `ns/other` requested and retrieval started.
fn started_with_two_chunks() -> Result<IdentityCredential<FixedClock>> {
    let builder = single_entry()
        .chunk_size(4)
        .entry("ns", "other", Value::Bool(true), vec![0]);
    let (mut credential, provisioned) = provision(builder)?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![RequestNamespace::new("ns")
        .item("name", 6, vec![0])
        .item("other", 1, vec![0])])?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: vec![2],
        ..Default::default()
    })?;
    Ok(credential)
}

#[test]
fn tampered_chunk_withholds_only_that_entry() -> Result<()> {
    let mut credential = started_with_two_chunks()?;
    let mut chunks = encrypted_chunks(&credential, "ns", "name")?;
    assert_eq!(chunks.len(), 2);
    let last = chunks[1].len() - 1;
    chunks[1][last] ^= 0x01;

    credential.start_retrieve_entry_value("ns", "name", 6, &[0])?;
    credential.retrieve_entry_value(&chunks[0])?;
    assert!(matches!(
        credential.retrieve_entry_value(&chunks[1]),
        Err(Error::Crypto(_))
    ));
    assert_eq!(credential.state(), State::Retrieving);

    retrieve(&mut credential, "ns", "other", &[0])?;
    let (_, device_namespaces) = credential.finish_retrieval()?;
    assert_eq!(
        decode(&device_namespaces),
        map(vec![("ns", map(vec![("other", Value::Bool(true))]))])
    );
    assert_eq!(
        credential.withheld_entries()[0].reason,
        WithholdReason::DecryptionFailed
    );
    Ok(())
}

#[test]
fn chunks_cannot_move_between_entries() -> Result<()> {
    let mut credential = started_with_two_chunks()?;
    let other = encrypted_chunks(&credential, "ns", "other")?;
    credential.start_retrieve_entry_value("ns", "name", 6, &[0])?;
    assert!(matches!(
        credential.retrieve_entry_value(&other[0]),
        Err(Error::Crypto(_))
    ));
    Ok(())
}

#[test]
fn overlong_entry_aborts() -> Result<()> {
    let mut credential = started_with_two_chunks()?;
    let chunks = encrypted_chunks(&credential, "ns", "name")?;
    credential.start_retrieve_entry_value("ns", "name", 6, &[0])?;
    credential.retrieve_entry_value(&chunks[0])?;
    assert!(matches!(
        credential.retrieve_entry_value(&chunks[0]),
        Err(Error::InvalidData(_))
    ));
    assert_eq!(credential.state(), State::Aborted);
    Ok(())
}

#[test]
fn entries_are_retrieved_one_at_a_time() -> Result<()> {
    let mut credential = started_with_two_chunks()?;
    let chunks = encrypted_chunks(&credential, "ns", "name")?;
    credential.start_retrieve_entry_value("ns", "name", 6, &[0])?;
    credential.retrieve_entry_value(&chunks[0])?;
    assert!(matches!(
        credential.start_retrieve_entry_value("ns", "other", 1, &[0]),
        Err(Error::OrderViolation(_))
    ));
    credential.retrieve_entry_value(&chunks[1])?;
    assert!(matches!(
        credential.retrieve_entry_value(&chunks[1]),
        Err(Error::OrderViolation(_))
    ));
    assert!(matches!(
        credential.start_retrieve_entry_value("ns", "name", 6, &[0]),
        Err(Error::InvalidData(_))
    ));
    Ok(())
}

#[test]
fn namespaces_follow_request_order() -> Result<()> {
    let builder = CredentialBuilder::new(DOC_TYPE)
        .access_control_profile(AccessControlProfile::no_auth(0))
        .entry("a", "x", Value::Bool(true), vec![0])
        .entry("b", "y", Value::Bool(false), vec![0]);
    let (mut credential, provisioned) = provision(builder)?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("b").item("y", 1, vec![0]),
        RequestNamespace::new("a").item("x", 1, vec![0]),
    ])?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        signing_key_blob,
        request_counts: vec![1, 1],
        ..Default::default()
    })?;

    assert!(matches!(
        credential.start_retrieve_entry_value("a", "x", 1, &[0]),
        Err(Error::OrderViolation(_))
    ));
    retrieve(&mut credential, "b", "y", &[0])?;
    retrieve(&mut credential, "a", "x", &[0])?;
    let (_, device_namespaces) = credential.finish_retrieval()?;
    assert_eq!(
        decode(&device_namespaces),
        map(vec![
            ("a", map(vec![("x", Value::Bool(true))])),
            ("b", map(vec![("y", Value::Bool(false))])),
        ])
    );
    Ok(())
}

#[test]
fn signature_path_needs_a_signing_key() -> Result<()> {
    let (mut credential, provisioned) = provision(single_entry())?;
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(vec![
        RequestNamespace::new("ns").item("name", 6, vec![0])
    ])?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: provisioned.access_control_profiles,
        request_counts: vec![1],
        ..Default::default()
    })?;
    retrieve(&mut credential, "ns", "name", &[0])?;
    assert!(matches!(
        credential.finish_retrieval(),
        Err(Error::SigningKeyNotFound)
    ));
    assert_eq!(credential.state(), State::Retrieving);
    Ok(())
}
