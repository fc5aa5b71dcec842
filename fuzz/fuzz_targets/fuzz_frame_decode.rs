#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use modbus_master::frame::{self, FrameDecoder};
use modbus_master::FrameEncoding;

#[derive(Debug, Arbitrary)]
struct Input {
    encoding: u8,
    response: bool,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let encoding = match input.encoding % 4 {
        0 => FrameEncoding::Tcp,
        1 => FrameEncoding::Rtu,
        2 => FrameEncoding::Ascii,
        _ => FrameEncoding::Binary,
    };
    let mut decoder = if input.response {
        FrameDecoder::response(encoding)
    } else {
        FrameDecoder::request(encoding)
    };

    // Feed the stream in arbitrary pieces; the decoder must never panic and
    // every frame it yields must survive a re-encode
    let mut buf = BytesMut::new();
    for chunk in &input.chunks {
        let _ = frame::decode(encoding, chunk);
        buf.extend_from_slice(chunk);
        while let Ok(Some(adu)) = decoder.decode(&mut buf) {
            let bytes = frame::encode(encoding, &adu).expect("decoded frame re-encodes");
            assert_eq!(frame::decode(encoding, &bytes).expect("re-encoded frame decodes"), adu);
        }
    }
});
