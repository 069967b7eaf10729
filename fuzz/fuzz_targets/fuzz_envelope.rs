#![no_main]

use bytes::Bytes;
use im_protocol_engine::core::envelope::{self, KeyRing};
use im_protocol_engine::core::packet::RawPacket;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let keys = KeyRing {
        session: None,
        bootstrap: Some([3; 32]),
    };
    let _ = envelope::unwrap(&RawPacket::new(Bytes::copy_from_slice(data)), &keys);
});
