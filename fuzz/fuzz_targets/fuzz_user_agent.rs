#![no_main]
use libfuzzer_sys::fuzz_target;
use trustgate::auth::labeler::{parse_user_agent, UNKNOWN};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let families = parse_user_agent(Some(s));
        assert!(!families.ua_family.is_empty());
        assert!(!families.os_family.is_empty());
        if s.is_empty() {
            assert_eq!(families.ua_family, UNKNOWN);
        }
    }
});
