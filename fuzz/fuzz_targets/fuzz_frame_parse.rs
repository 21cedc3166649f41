#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(parts) = aircast::parse_frame(aircast::Role::Ground, data) {
        let _ = aircast::wire::frame_aad(parts.header.radio_port, parts.header.nonce);
    }
});
