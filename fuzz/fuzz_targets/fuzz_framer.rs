#![no_main]

use im_protocol_engine::core::framer::Framer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let mut framer = Framer::new(64 * 1024);
    for chunk in rest.chunks(usize::from(split).max(1)) {
        if framer.offer(chunk, |frame| assert!(frame.len() >= 4)).is_err() {
            return;
        }
    }
});
