//! `Set-Cookie` / `Cookie` handling for the device secret.
//!
//! The secret lives in an HttpOnly, Secure, `SameSite=None` cookie scoped to
//! `/`, expiring with the device.

use chrono::{DateTime, Utc};

/// Cookie carrying the trusted-device secret.
pub struct TrustCookie;

impl TrustCookie {
    pub const NAME: &'static str = "td_v1";

    const ATTRIBUTES: &'static str = "Path=/; HttpOnly; Secure; SameSite=None";

    /// `Set-Cookie` value storing `secret` until `expires_at`.
    pub fn set_header(secret: &str, expires_at: DateTime<Utc>) -> String {
        let max_age = (expires_at - Utc::now()).num_seconds().max(0);
        format!(
            "{}={secret}; Expires={}; Max-Age={max_age}; {}",
            Self::NAME,
            http_date(expires_at),
            Self::ATTRIBUTES
        )
    }

    /// `Set-Cookie` value that removes the cookie.
    pub fn clear_header() -> String {
        format!(
            "{}=; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; {}",
            Self::NAME,
            Self::ATTRIBUTES
        )
    }

    /// Pull the secret out of a `Cookie` request header. Empty values count
    /// as absent.
    pub fn extract(cookie_header: &str) -> Option<&str> {
        cookie_header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == Self::NAME)
            .map(|(_, value)| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
    }
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
