#![no_main]

use libfuzzer_sys::fuzz_target;
use mirrorhost_core::sink::{FRAME_HEADER_LEN, decode_frame, decode_header, decode_response, parse_info};

fuzz_target!(|data: &[u8]| {
    // Header parsing must never claim more than the frame cap.
    if let Ok(len) = decode_header(data) {
        assert!(len <= mirrorhost_core::sink::MAX_FRAME_BYTES);
    }

    if let Ok(payload) = decode_frame(data) {
        assert_eq!(payload.len() + FRAME_HEADER_LEN, data.len());
        if let Ok(report) = decode_response(payload) {
            let _ = report.has_failures();
        }
    }

    // Raw payloads straight into the response decoder and info parser.
    let _ = decode_response(data);
    if let Ok(text) = std::str::from_utf8(data) {
        let report = parse_info(text);
        let _ = report.total;
    }
});
