#![no_main]
use libfuzzer_sys::fuzz_target;
use trustgate::auth::{codec, TrustCookie};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(value) = TrustCookie::extract(s) {
            assert!(!value.is_empty());
            assert!(!value.contains(';'));
        }
        // Arbitrary client input must never panic the comparison path
        let _ = codec::constant_time_eq(s, s);
    }
});
