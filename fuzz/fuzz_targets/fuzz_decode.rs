#![no_main]

use libfuzzer_sys::fuzz_target;
use sos_mesh::core::codec::{decode, encode};

fuzz_target!(|data: &[u8]| {
    // Arbitrary advertisements must never panic, and anything that decodes
    // must survive a second trip through the codec
    if let Ok(packet) = decode(data) {
        let profile = if data.len() >= 2 && data[..2] == [0x53, 0x45] {
            sos_mesh::core::codec::WireProfile::Extended
        } else {
            sos_mesh::core::codec::WireProfile::Legacy
        };
        let again = decode(&encode(&packet, profile));
        assert!(again.is_ok());
    }
});
