use std::collections::BTreeMap;

use anyhow::{bail, Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use identity_credential::access_control::{AccessControlProfile, SecureAccessControlProfile};
use identity_credential::cbor;
use identity_credential::credential::{AesKey, CredentialBuilder, CredentialRecord};
use identity_credential::definitions::device_request::RequestNamespace;
use identity_credential::definitions::helpers::ByteStr;
use identity_credential::presentation::{
    EntryAccess, IdentityCredential, IdentityCredentialApi, RetrievalParameters,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base64 encoded 16 byte hardware-bound key. Not needed for test credentials.
    #[arg(long, global = true)]
    hardware_key: Option<String>,
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Provision a credential from a JSON document of the form `{namespace: {name: value}}`.
    Provision {
        #[arg(long)]
        doc_type: String,
        /// Seal with the well-known test key.
        #[arg(long)]
        test: bool,
        document: MaybeStdin<String>,
    },
    /// Retrieve every entry of a provisioned credential and print the signed response.
    Present {
        /// Base64 encoded output of `provision`.
        credential: MaybeStdin<String>,
    },
    /// Print the namespaces and element identifiers of a provisioned credential.
    GetNamespaces {
        /// Base64 encoded output of `provision`.
        credential: MaybeStdin<String>,
    },
}

/// What `provision` prints and the other commands read back.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Provisioned {
    credential_data: ByteStr,
    access_control_profiles: Vec<SecureAccessControlProfile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Presentation {
    device_name_spaces: serde_json::Value,
    device_signature: String,
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let hardware_key = args.hardware_key.as_deref();
    let output = match args.action {
        Action::Provision {
            doc_type,
            test,
            document,
        } => provision(&doc_type, test, hardware_key, &document.to_string())?,
        Action::Present { credential } => present(&credential.to_string(), hardware_key)?,
        Action::GetNamespaces { credential } => {
            print_namespaces(&credential.to_string(), hardware_key)?
        }
    };
    println!("{output}");
    Ok(())
}

fn hardware_bound_key(encoded: Option<&str>, test: bool) -> Result<AesKey, Error> {
    match encoded {
        Some(encoded) => {
            let bytes = base64::decode(encoded.trim()).context("hardware key is not base64")?;
            AesKey::from_slice(&bytes).context("hardware key must be 16 bytes")
        }
        None if test => Ok(AesKey::test_key()),
        None => bail!("--hardware-key is required for non-test credentials"),
    }
}

fn provision(
    doc_type: &str,
    test: bool,
    hardware_key: Option<&str>,
    document: &str,
) -> Result<String, Error> {
    let document: BTreeMap<String, BTreeMap<String, serde_json::Value>> =
        serde_json::from_str(document).context("document is not a JSON object of namespaces")?;
    let mut builder = CredentialBuilder::new(doc_type)
        .test_credential(test)
        .access_control_profile(AccessControlProfile::no_auth(0));
    for (namespace, entries) in document {
        for (name, value) in entries {
            let value = cbor::into_value(value)
                .with_context(|| format!("'{namespace}/{name}' cannot be encoded as CBOR"))?;
            builder = builder.entry(namespace.clone(), name, value, vec![0]);
        }
    }
    let provisioned = builder.build(&hardware_bound_key(hardware_key, test)?)?;
    let bundle = Provisioned {
        credential_data: provisioned.credential_data.into(),
        access_control_profiles: provisioned.access_control_profiles,
    };
    Ok(base64::encode(cbor::to_vec(&bundle)?))
}

fn load(encoded: &str) -> Result<Provisioned, Error> {
    let bytes = base64::decode(encoded.trim()).context("credential is not base64")?;
    cbor::from_slice(&bytes).context("could not parse provisioned credential")
}

/// Test credentials decrypt with the test key whatever key is passed, so a missing
/// `--hardware-key` falls back to it.
fn load_record(
    bundle: &Provisioned,
    hardware_key: Option<&str>,
) -> Result<CredentialRecord, Error> {
    let key = hardware_bound_key(hardware_key, true)?;
    CredentialRecord::load(bundle.credential_data.as_ref(), &key)
        .context("could not load credential")
}

fn present(encoded: &str, hardware_key: Option<&str>) -> Result<String, Error> {
    let bundle = load(encoded)?;
    let record = load_record(&bundle, hardware_key)?;
    let requests: Vec<RequestNamespace> = record
        .namespaces()
        .iter()
        .map(|(namespace, entries)| {
            entries.iter().fold(RequestNamespace::new(namespace), |request, (name, entry)| {
                request.item(name, entry.size, entry.access_control_profile_ids.clone())
            })
        })
        .collect();
    let request_counts = requests.iter().map(|request| request.items.len()).collect();

    let mut credential = IdentityCredential::new(
        bundle.credential_data.into(),
        hardware_bound_key(hardware_key, true)?,
    );
    credential.initialize()?;
    credential.create_ephemeral_key_pair()?;
    credential.set_requested_namespaces(requests.clone())?;
    let (signing_key_blob, _) = credential.generate_signing_key_pair()?;
    credential.start_retrieval(RetrievalParameters {
        access_control_profiles: bundle.access_control_profiles,
        signing_key_blob,
        request_counts,
        ..Default::default()
    })?;

    for request in &requests {
        for item in &request.items {
            let access = credential.start_retrieve_entry_value(
                &request.namespace_name,
                &item.name,
                item.size,
                &item.access_control_profile_ids,
            )?;
            if access != EntryAccess::Granted {
                continue;
            }
            let entry = record
                .entry(&request.namespace_name, &item.name)
                .context("requested entry vanished")?;
            for chunk in entry.encrypted_chunks.iter() {
                credential.retrieve_entry_value(chunk.as_ref())?;
            }
        }
    }
    let (signature, device_namespaces) = credential.finish_retrieval()?;

    let namespaces: ciborium::Value = cbor::from_slice(&device_namespaces)?;
    let presentation = Presentation {
        device_name_spaces: cbor::from_value(namespaces)?,
        device_signature: base64::encode(signature),
    };
    Ok(serde_json::to_string_pretty(&presentation)?)
}

fn print_namespaces(encoded: &str, hardware_key: Option<&str>) -> Result<String, Error> {
    let record = load_record(&load(encoded)?, hardware_key)?;
    let claims = record
        .namespaces()
        .iter()
        .map(|(ns, entries)| (ns.clone(), entries.keys().cloned().collect()))
        .collect::<BTreeMap<String, Vec<String>>>();
    Ok(serde_json::to_string_pretty(&claims)?)
}
