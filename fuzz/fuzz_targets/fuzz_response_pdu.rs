#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use modbus_master::{Request, Response};

#[derive(Debug, Arbitrary)]
struct Input {
    request: Vec<u8>,
    response: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let Ok(request) = Request::from_pdu(&input.request) else {
        return;
    };
    // Malformed replies must be rejected, never panic
    let _ = Response::from_pdu(&request, &input.response);
});
