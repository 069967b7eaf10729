#![no_main]

use im_protocol_engine::core::tars;
use im_protocol_engine::protocol::message::ServerListPush;
use im_protocol_engine::core::tars::Structured;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Schema-less and shaped decoding must reject, never panic
    let _ = tars::decode_any(data);
    let _ = ServerListPush::from_bytes(data);
});
