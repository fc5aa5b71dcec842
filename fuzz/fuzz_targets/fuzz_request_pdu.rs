#![no_main]

use libfuzzer_sys::fuzz_target;
use modbus_master::Request;

fuzz_target!(|data: &[u8]| {
    // Anything that parses must be a valid request that survives a rebuild.
    // Byte equality does not hold: coil padding bits are not preserved.
    if let Ok(request) = Request::from_pdu(data) {
        let pdu = request.to_pdu().expect("parsed request is valid");
        assert_eq!(Request::from_pdu(pdu.as_slice()).expect("rebuilt request parses"), request);
    }
});
