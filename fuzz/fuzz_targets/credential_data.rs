#![no_main]

use identity_credential::credential::{AesKey, CredentialRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = CredentialRecord::load(data, &AesKey::test_key());
});
