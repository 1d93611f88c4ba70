//! Error types for the primary downloader.

use thiserror::Error;

use crate::download::DownloadError;

/// Errors from resolving or streaming through the primary source.
#[derive(Debug, Error)]
pub enum PrimaryError {
    /// The resolution request never got an answer.
    #[error("primary API request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The resolution request exceeded its (short) timeout.
    #[error("primary API request to {url} timed out")]
    Timeout { url: String },

    /// Non-2xx answer without a parseable JSON body.
    #[error("primary API returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// 2xx answer whose body was not the expected JSON.
    #[error("primary API returned an unreadable response: {message}")]
    InvalidResponse { message: String },

    /// The configured API base URL cannot be parsed.
    #[error(
        "invalid primary API base URL: {url}\n  Suggestion: Set [primary].api_base to an absolute http(s) URL"
    )]
    InvalidBaseUrl { url: String },

    /// Resolution succeeded but streaming the payload failed.
    #[error(transparent)]
    Transfer(#[from] DownloadError),
}

impl PrimaryError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// True when the failure happened before any payload bytes were requested.
    #[must_use]
    pub fn is_resolution_failure(&self) -> bool {
        !matches!(self, Self::Transfer(_))
    }
}
