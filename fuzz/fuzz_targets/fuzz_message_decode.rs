#![no_main]

use bytes::Bytes;
use cluster_dispatch::protocol::message::{decode, encode, RouteCodes};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks whether a route-code table is in effect
    let codes = RouteCodes::from_routes(["slots.spin", "chat.say"]);
    let codes = (data[0] & 1 == 1).then_some(&codes);

    if let Ok(msg) = decode(Bytes::copy_from_slice(&data[1..]), codes) {
        // Anything that decodes must encode again and decode to the same message
        if let Ok(wire) = encode(&msg, codes) {
            let again = decode(wire, codes).ok();
            assert_eq!(again.as_ref(), Some(&msg));
        }
    }
});
