//! Arbitrary bytes fed to the wire decoder.
//!
//! Malformed datagrams must come back as errors. Anything that decodes must
//! encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;

use rollback_netplay::network::codec;
use rollback_netplay::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = codec::decode_value::<Message>(data) {
        let encoded = codec::encode(&msg).expect("decoded message re-encodes");
        let again: Message = codec::decode_value(&encoded).expect("re-encoded message decodes");
        assert_eq!(msg, again);
    }
});
