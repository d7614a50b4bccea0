//! Coarse browser / OS labelling of user-agent strings.
//!
//! Used for the device list and as a drift signal on verification. This is
//! substring matching, not a real UA parser: first match wins, in the order
//! of the tables below.

use serde::{Deserialize, Serialize};

/// Label used when nothing matches.
pub const UNKNOWN: &str = "Unknown";

const BROWSERS: &[(&str, &str)] = &[
    ("Chrome", "Chrome"),
    ("Firefox", "Firefox"),
    ("Safari", "Safari"),
    ("Edge", "Edge"),
];

const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Mac", "macOS"),
    ("Linux", "Linux"),
    ("Android", "Android"),
    ("iOS", "iOS"),
];

/// Browser and OS family derived from a user agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentFamilies {
    pub ua_family: String,
    pub os_family: String,
}

impl UserAgentFamilies {
    /// Whether either family differs from the stored pair.
    pub fn drifted_from(&self, ua_family: &str, os_family: &str) -> bool {
        self.ua_family != ua_family || self.os_family != os_family
    }
}

/// Classify a raw user-agent string.
pub fn parse_user_agent(user_agent: Option<&str>) -> UserAgentFamilies {
    let ua = user_agent.unwrap_or("");
    UserAgentFamilies {
        ua_family: first_match(ua, BROWSERS).to_string(),
        os_family: first_match(ua, OPERATING_SYSTEMS).to_string(),
    }
}

fn first_match(ua: &str, table: &[(&'static str, &'static str)]) -> &'static str {
    if ua.is_empty() {
        return UNKNOWN;
    }
    table
        .iter()
        .find(|(needle, _)| ua.contains(*needle))
        .map_or(UNKNOWN, |&(_, label)| label)
}
