//! Primary (fast, quota-limited) acquisition path.
//!
//! The primary source hands out short-lived download URLs through a JSON
//! endpoint. Every answer carries the account's daily allowance, which is
//! persisted through the [`QuotaTracker`] whether or not a URL came back.
//!
//! Flow for [`PrimaryDownloader::acquire`]:
//! 1. resolve a URL (short timeout);
//! 2. stream it to the temp directory (long timeout);
//! 3. on a transient transfer failure, resolve again against the next mirror
//!    index until the configured attempts are used up.
//!
//! Quota exhaustion and other API refusals are returned as values, not
//! errors, so the orchestrator can route to the fallback.

mod api;
mod error;

pub use api::{AccountQuota, FastDownloadResponse, ResolveOutcome, is_exhaustion_message};
pub use error::PrimaryError;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::{
    CancelToken, FailureKind, HttpClient, ProgressSender, TransferRequest, TransferResult,
    classify_error,
};
use crate::quota::QuotaTracker;

/// Path of the resolution endpoint under the API base.
const FAST_DOWNLOAD_PATH: &str = "dyn/api/fast_download.json";

/// Connection settings for the primary API.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Base URL, e.g. `https://primary.example.org/`.
    pub api_base: String,
    /// Account secret sent as the `key` query parameter.
    pub key: String,
    pub resolve_timeout: Duration,
    /// Default `path_index` when the caller gives no hint.
    pub path_index: Option<u32>,
    /// First `domain_index` tried; later attempts increment it.
    pub domain_index: Option<u32>,
    /// How many mirror indexes to try on transient transfer failures.
    pub mirror_attempts: u32,
}

/// Result of one resolution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolveOutcome,
    pub quota: Option<AccountQuota>,
}

/// Where the payload should land.
#[derive(Debug, Clone, Copy)]
pub struct AcquireTarget<'a> {
    pub hash: &'a str,
    pub format: Option<&'a str>,
    pub temp_dir: &'a Path,
}

/// Terminal outcome of a primary acquisition that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryAcquisition {
    Downloaded(TransferResult),
    QuotaExhausted { message: String },
    /// The API refused for a reason other than quota.
    Unavailable { message: String },
}

/// Resolves and streams artifacts from the primary source.
#[derive(Debug, Clone)]
pub struct PrimaryDownloader {
    config: PrimaryConfig,
    endpoint: Url,
    client: HttpClient,
    quota: QuotaTracker,
}

impl PrimaryDownloader {
    /// # Errors
    ///
    /// Returns [`PrimaryError::InvalidBaseUrl`] if `config.api_base` does not
    /// parse as an absolute URL.
    pub fn new(
        config: PrimaryConfig,
        client: HttpClient,
        quota: QuotaTracker,
    ) -> Result<Self, PrimaryError> {
        let endpoint = build_endpoint(&config.api_base)?;
        Ok(Self {
            config,
            endpoint,
            client,
            quota,
        })
    }

    /// Asks the primary API for a download URL.
    ///
    /// Any quota object in the answer is persisted before this returns, on
    /// success and on failure alike.
    ///
    /// # Errors
    ///
    /// Returns [`PrimaryError`] on network failure, timeout, or an unreadable
    /// response. API-level refusals are reported through
    /// [`Resolution::outcome`].
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn resolve_url(
        &self,
        hash: &str,
        path_hint: Option<u32>,
        domain_hint: Option<u32>,
    ) -> Result<Resolution, PrimaryError> {
        let url = self.request_url(hash, path_hint, domain_hint);

        let response = self
            .client
            .inner()
            .get(url)
            .timeout(self.config.resolve_timeout)
            .send()
            .await
            .map_err(|e| PrimaryError::network(self.endpoint.as_str(), e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PrimaryError::network(self.endpoint.as_str(), e))?;

        let parsed: FastDownloadResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(error) if status.is_success() => {
                return Err(PrimaryError::InvalidResponse {
                    message: error.to_string(),
                });
            }
            Err(_) => {
                return Err(PrimaryError::HttpStatus {
                    status: status.as_u16(),
                });
            }
        };

        if let Some(quota) = &parsed.account_fast_download_info {
            self.quota
                .record_best_effort(hash, quota.downloads_left, quota.downloads_per_day)
                .await;
        }

        let outcome = parsed.outcome();
        debug!(status = status.as_u16(), outcome = ?outcome, "primary resolution");
        Ok(Resolution {
            outcome,
            quota: parsed.account_fast_download_info,
        })
    }

    /// Resolves and streams `target.hash` to the temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`PrimaryError`] when resolution fails at the transport level
    /// or the transfer fails after all mirror attempts.
    #[instrument(skip(self, target, progress, cancel), fields(hash = %target.hash))]
    pub async fn acquire(
        &self,
        target: &AcquireTarget<'_>,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> Result<PrimaryAcquisition, PrimaryError> {
        let attempts = self.config.mirror_attempts.max(1);
        let first_domain = self.config.domain_index.unwrap_or(0);
        let mut attempt: u32 = 0;

        loop {
            let resolution = self
                .resolve_url(target.hash, None, Some(first_domain + attempt))
                .await?;

            let url = match resolution.outcome {
                ResolveOutcome::Ready { url } => url,
                ResolveOutcome::QuotaExhausted { message } => {
                    info!(message = %message, "primary quota exhausted");
                    return Ok(PrimaryAcquisition::QuotaExhausted { message });
                }
                ResolveOutcome::Failed { message } => {
                    warn!(message = %message, "primary API declined");
                    return Ok(PrimaryAcquisition::Unavailable { message });
                }
            };

            let request = TransferRequest {
                url: &url,
                hash: target.hash,
                format: target.format,
                output_dir: target.temp_dir,
            };

            match self.client.download(&request, progress, cancel).await {
                Ok(result) => return Ok(PrimaryAcquisition::Downloaded(result)),
                Err(error) => {
                    attempt += 1;
                    let retryable = classify_error(&error) == FailureKind::TransientNetwork;
                    if retryable && attempt < attempts && !cancel.is_cancelled() {
                        warn!(
                            attempt,
                            max_attempts = attempts,
                            error = %error,
                            "primary transfer failed, trying next mirror"
                        );
                        continue;
                    }
                    return Err(error.into());
                }
            }
        }
    }

    fn request_url(&self, hash: &str, path_hint: Option<u32>, domain_hint: Option<u32>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("md5", hash);
            query.append_pair("key", &self.config.key);
            if let Some(path_index) = path_hint.or(self.config.path_index) {
                query.append_pair("path_index", &path_index.to_string());
            }
            if let Some(domain_index) = domain_hint.or(self.config.domain_index) {
                query.append_pair("domain_index", &domain_index.to_string());
            }
        }
        url
    }
}

fn build_endpoint(api_base: &str) -> Result<Url, PrimaryError> {
    let invalid = || PrimaryError::InvalidBaseUrl {
        url: api_base.to_string(),
    };
    let mut base = Url::parse(api_base).map_err(|_| invalid())?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid());
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(FAST_DOWNLOAD_PATH).map_err(|_| invalid())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_endpoint_appends_api_path() {
        let endpoint = build_endpoint("https://primary.example.org").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "https://primary.example.org/dyn/api/fast_download.json"
        );
        let nested = build_endpoint("https://primary.example.org/mirror").unwrap();
        assert_eq!(
            nested.as_str(),
            "https://primary.example.org/mirror/dyn/api/fast_download.json"
        );
    }

    #[test]
    fn test_build_endpoint_rejects_non_http() {
        assert!(matches!(
            build_endpoint("ftp://primary.example.org"),
            Err(PrimaryError::InvalidBaseUrl { .. })
        ));
        assert!(build_endpoint("primary.example.org").is_err());
    }
}
