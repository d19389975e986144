#![no_main]

use cluster_dispatch::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz packet parsing - test for panics, crashes, oversized allocations
    if let Ok(packet) = Packet::from_bytes(data) {
        if let Ok(bytes) = packet.to_bytes() {
            assert_eq!(&bytes[..], &data[..bytes.len()]);
        }
    }
});
