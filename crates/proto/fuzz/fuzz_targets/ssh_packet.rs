//! Fuzz target for SSH frame parsing.
//!
//! Feeds random input to the frame parser and the frame body splitter,
//! looking for panics and inconsistent round trips.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tidewire_proto::ssh::packet::{split_frame_body, Packet};

fuzz_target!(|data: &[u8]| {
    if data.len() > 4 {
        let _ = split_frame_body(&data[4..]);
    }

    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed =
            Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }
});
