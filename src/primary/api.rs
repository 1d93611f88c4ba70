//! Wire types for the primary fast-download API and exhaustion detection.

use serde::Deserialize;

/// Error-message fragments that mean "no allowance left".
///
/// Only consulted when the response carries no structured quota. Upstream
/// wording changes silently break this list.
const EXHAUSTION_MARKERS: &[&str] = &[
    "no downloads left",
    "download limit",
    "quota exceeded",
    "daily limit",
    "not enough downloads",
];

/// Body of `GET /dyn/api/fast_download.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FastDownloadResponse {
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "quota")]
    pub account_fast_download_info: Option<AccountQuota>,
}

/// Per-account allowance reported alongside every resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccountQuota {
    pub downloads_left: i64,
    pub downloads_per_day: i64,
    #[serde(default, alias = "recently_downloaded")]
    pub recently_downloaded_md5s: Vec<String>,
}

/// What a resolution call means for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// A transient URL to stream from.
    Ready { url: String },
    /// The allowance is used up.
    QuotaExhausted { message: String },
    /// The API declined for another reason.
    Failed { message: String },
}

impl FastDownloadResponse {
    /// Interprets the response.
    ///
    /// A returned URL always wins. Without one, a structured `downloads_left`
    /// of zero is authoritative; the message markers are used only when the
    /// structured quota is absent.
    #[must_use]
    pub fn outcome(&self) -> ResolveOutcome {
        if let Some(url) = self.download_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return ResolveOutcome::Ready {
                url: url.to_string(),
            };
        }

        let message = self
            .error
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "primary API returned no download URL".to_string());

        let exhausted = match &self.account_fast_download_info {
            Some(quota) => quota.downloads_left <= 0,
            None => is_exhaustion_message(&message),
        };

        if exhausted {
            ResolveOutcome::QuotaExhausted { message }
        } else {
            ResolveOutcome::Failed { message }
        }
    }
}

/// Case-insensitive match against known exhaustion messages.
#[must_use]
pub fn is_exhaustion_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    EXHAUSTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
