#![no_main]

use identity_credential::definitions::device_request::ItemsRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = ItemsRequest::from_slice(data);
});
