//! Shared User-Agent string for all outbound HTTP traffic.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/hashfetch";

/// Default User-Agent for resolution, transfer and upload requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("hashfetch/{version} (+{PROJECT_UA_URL})")
}
