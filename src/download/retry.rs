//! Failure classification and retry backoff.
//!
//! Every acquisition failure is classified into a [`FailureKind`]. The kind
//! decides what the orchestrator does locally (fall back, park as `delayed`,
//! mark `error`) and is persisted as an [`ErrorKind`] so the
//! [`crate::Scheduler`] can later decide whether a failed record gets another
//! attempt through [`RetryPolicy::should_retry`].
//!
//! # Example
//!
//! ```
//! use hashfetch_core::download::{DownloadError, FailureKind, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/file.pdf", 503);
//! let kind = classify_error(&error);
//! assert_eq!(kind, FailureKind::TransientNetwork);
//!
//! match policy.should_retry(kind, 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("retry #{attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::constants::MAX_RETRY_AFTER;
use crate::store::ErrorKind;

/// Default retry budget for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of acquisition and post-download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout or 5xx; retryable within the budget.
    TransientNetwork,
    /// The primary allowance is used up; not a fault.
    QuotaExhausted,
    /// Local disk failure; fatal for the attempt.
    Filesystem,
    /// No usable primary credential or endpoint.
    Configuration,
    /// The source will not serve this artifact as requested.
    Permanent,
    /// Library upload failed; never affects the download status.
    Upload,
}

impl FailureKind {
    /// Persisted form of this failure, for the retry scheduler.
    #[must_use]
    pub fn error_kind(self) -> ErrorKind {
        match self {
            Self::TransientNetwork | Self::QuotaExhausted | Self::Upload => ErrorKind::Transient,
            Self::Filesystem => ErrorKind::Filesystem,
            Self::Configuration => ErrorKind::Configuration,
            Self::Permanent => ErrorKind::Permanent,
        }
    }
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transient => Self::TransientNetwork,
            ErrorKind::Filesystem => Self::Filesystem,
            ErrorKind::Configuration => Self::Configuration,
            ErrorKind::Permanent => Self::Permanent,
        }
    }
}

/// Decision on whether to retry a failed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the 1-indexed number of the next try.
    Retry { delay: Duration, attempt: u32 },

    /// Do not retry.
    DoNotRetry { reason: String },
}

/// Exponential backoff with jitter.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults (30 s base, doubling), delays are roughly 30 s, 60 s, 120 s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether a record that failed `attempt` times gets another try.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureKind::Filesystem => {
                return RetryDecision::DoNotRetry {
                    reason: "filesystem failure - fix the local disk problem and reactivate"
                        .to_string(),
                };
            }
            FailureKind::Configuration => {
                return RetryDecision::DoNotRetry {
                    reason: "no acquisition path configured".to_string(),
                };
            }
            FailureKind::Upload => {
                return RetryDecision::DoNotRetry {
                    reason: "upload failures are retried by re-running the pipeline".to_string(),
                };
            }
            FailureKind::TransientNetwork | FailureKind::QuotaExhausted => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + calculate_jitter()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a transfer error.
///
/// | Error | Kind |
/// |-------|------|
/// | HTTP 408, 429, 5xx | `TransientNetwork` |
/// | Other HTTP 4xx | `Permanent` |
/// | Timeout, most network errors, empty body | `TransientNetwork` |
/// | TLS / certificate errors | `Permanent` |
/// | IO | `Filesystem` |
/// | Invalid URL, cancelled | `Permanent` |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } | DownloadError::EmptyBody { .. } => {
            FailureKind::TransientNetwork
        }
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureKind::Permanent
            } else {
                FailureKind::TransientNetwork
            }
        }
        DownloadError::Io { .. } => FailureKind::Filesystem,
        DownloadError::ClientBuild(_) => FailureKind::Configuration,
        DownloadError::InvalidUrl { .. } | DownloadError::Cancelled { .. } => {
            FailureKind::Permanent
        }
    }
}

fn classify_http_status(status: u16) -> FailureKind {
    match status {
        408 | 429 | 500..=599 => FailureKind::TransientNetwork,
        _ => FailureKind::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
pub(crate) fn is_tls_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_lowercase();
        if text.contains("certificate")
            || text.contains("tls")
            || text.contains("ssl")
            || text.contains("handshake")
        {
            return true;
        }
        current = err.source();
    }
    false
}

/// Parses a `Retry-After` header (delta-seconds or HTTP-date), capped at 1 hour.
///
/// Returns `None` for negative, past, or unparseable values.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(cap_retry_after(Duration::from_secs(seconds)));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(cap_retry_after(duration)),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, ignoring");
            None
        }
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        return MAX_RETRY_AFTER;
    }
    duration
}
