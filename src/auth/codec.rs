//! Device secret generation and peppered token hashing.
//!
//! A device secret is 32 random bytes handed to the client once. The server
//! only keeps `HMAC-SHA256(pepper, secret)`, base64url-encoded without
//! padding. Comparison of digests is constant-time over the decoded bytes.

use super::error::TrustError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Device secret byte length before encoding (256 bits of entropy).
pub const SECRET_BYTES: usize = 32;

/// HMAC-SHA256 output length.
pub const DIGEST_BYTES: usize = 32;

/// Generate a fresh device secret (base64url, no padding).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the stored token hash for `secret` under `pepper`.
pub fn hash(pepper: &str, secret: &str) -> Result<String, TrustError> {
    if pepper.is_empty() {
        return Err(TrustError::MissingPepper);
    }
    let mut mac = HmacSha256::new_from_slice(pepper.as_bytes())
        .map_err(|_| TrustError::MissingPepper)?;
    mac.update(secret.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Compare two encoded digests without short-circuiting on the first
/// differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (left, left_ok) = decode_digest(a);
    let (right, right_ok) = decode_digest(b);

    let mut diff = 0u8;
    for (x, y) in left.iter().zip(right.iter()) {
        diff |= x ^ y;
    }
    diff == 0 && left_ok && right_ok
}

/// Decode into a fixed-size buffer. Malformed input still yields a full
/// buffer so the comparison loop does the same amount of work.
fn decode_digest(encoded: &str) -> ([u8; DIGEST_BYTES], bool) {
    let mut out = [0u8; DIGEST_BYTES];
    match URL_SAFE_NO_PAD.decode(encoded) {
        Ok(bytes) if bytes.len() == DIGEST_BYTES => {
            out.copy_from_slice(&bytes);
            (out, true)
        }
        _ => (out, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::hint::black_box;
    use std::time::{Duration, Instant};

    #[test]
    fn secret_has_expected_shape() {
        let secret = generate_secret();
        // 32 bytes → 43 base64url chars without padding
        assert_eq!(secret.len(), 43);
        assert!(!secret.contains('='));
        assert!(!secret.contains('+'));
        assert!(!secret.contains('/'));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn hash_is_deterministic() {
        let h1 = hash("pepper-one", "secret-value").unwrap();
        let h2 = hash("pepper-one", "secret-value").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(URL_SAFE_NO_PAD.decode(&h1).unwrap().len(), DIGEST_BYTES);
    }

    #[test]
    fn hash_depends_on_pepper() {
        let h1 = hash("pepper-one", "secret-value").unwrap();
        let h2 = hash("pepper-two", "secret-value").unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_matches_known_vector() {
        // RFC 4231 test case 2
        let digest = hash("Jefe", "what do ya want for nothing?").unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(digest).unwrap();
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(
            hex,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hash_without_pepper_fails() {
        let err = hash("", "secret-value").unwrap_err();
        assert!(matches!(err, TrustError::MissingPepper));
    }

    #[test]
    fn thousand_secrets_produce_distinct_digests() {
        let digests: HashSet<String> = (0..1000)
            .map(|_| hash("pepper", &generate_secret()).unwrap())
            .collect();
        assert_eq!(digests.len(), 1000);
    }

    #[test]
    fn constant_time_eq_works() {
        let a = hash("pepper", "alpha").unwrap();
        let b = hash("pepper", "beta").unwrap();
        assert!(constant_time_eq(&a, &a));
        assert!(!constant_time_eq(&a, &b));
    }

    #[test]
    fn constant_time_eq_rejects_malformed_input() {
        let a = hash("pepper", "alpha").unwrap();
        assert!(!constant_time_eq(&a, "not base64 !!"));
        assert!(!constant_time_eq(&a, "c2hvcnQ"));
        assert!(!constant_time_eq("", ""));
    }

    fn time_comparisons(a: &str, b: &str, rounds: usize) -> Duration {
        let start = Instant::now();
        for _ in 0..rounds {
            black_box(constant_time_eq(black_box(a), black_box(b)));
        }
        start.elapsed()
    }

    #[test]
    fn comparison_time_does_not_depend_on_mismatch_position() {
        let base = [0x5au8; DIGEST_BYTES];
        let mut first = base;
        first[0] ^= 0xff;
        let mut last = base;
        last[DIGEST_BYTES - 1] ^= 0xff;

        let base = URL_SAFE_NO_PAD.encode(base);
        let first = URL_SAFE_NO_PAD.encode(first);
        let last = URL_SAFE_NO_PAD.encode(last);

        // Best of several batches to shave off scheduler noise.
        let rounds = 20_000;
        let mut best_first = Duration::MAX;
        let mut best_last = Duration::MAX;
        for _ in 0..7 {
            best_first = best_first.min(time_comparisons(&base, &first, rounds));
            best_last = best_last.min(time_comparisons(&base, &last, rounds));
        }

        let ratio = best_first.as_secs_f64() / best_last.as_secs_f64().max(f64::EPSILON);
        assert!(
            (0.33..3.0).contains(&ratio),
            "first-byte/last-byte timing ratio out of tolerance: {ratio:.3}"
        );
    }
}
