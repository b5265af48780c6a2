//! Fuzz target for SSH field decoding and the message parsers built on it.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_codec -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tidewire_proto::ssh::auth::AuthRequest;
use tidewire_proto::ssh::codec::{pack, unpack, FieldKind};
use tidewire_proto::ssh::connection::ChannelOpen;
use tidewire_proto::ssh::kex::KexInit;

const LAYOUT: [FieldKind; 6] = [
    FieldKind::Byte,
    FieldKind::Boolean,
    FieldKind::Uint32,
    FieldKind::String,
    FieldKind::NameList,
    FieldKind::Mpint,
];

fuzz_target!(|data: &[u8]| {
    if let Ok((values, end)) = unpack(&LAYOUT, data, 0) {
        assert!(end <= data.len());
        let encoded = pack(&LAYOUT, &values).expect("decoded values must encode");
        let (again, _) = unpack(&LAYOUT, &encoded, 0).expect("re-encoded data must decode");
        assert_eq!(values, again);
    }

    let _ = KexInit::from_bytes(data);
    let _ = AuthRequest::from_bytes(data);
    let _ = ChannelOpen::from_bytes(data);
});
