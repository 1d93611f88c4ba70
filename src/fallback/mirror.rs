//! Direct-mirror fallback.
//!
//! Streams from a configured URL template. Mirrors of this kind throttle
//! with HTTP 429/503 plus `Retry-After`; that wait is surfaced as a countdown
//! so the record shows why nothing is moving, and a countdown interrupted by
//! a restart resumes with only the remaining seconds.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{CountdownState, FallbackDownloader, FallbackOutcome, FallbackRequest};
use crate::download::{
    CancelToken, DownloadError, FailureKind, HttpClient, ProgressEvent, ProgressSender,
    TransferRequest, classify_error, parse_retry_after,
};
use crate::store::unix_now;

/// Placeholder replaced by the content hash in the URL template.
pub const HASH_PLACEHOLDER: &str = "{hash}";

/// Settings for [`MirrorFallback`].
#[derive(Debug, Clone)]
pub struct MirrorFallbackConfig {
    /// URL containing `{hash}`, e.g. `https://mirror.example.org/get/{hash}`.
    pub url_template: String,
    pub max_attempts: u32,
    /// Wait used when a throttling response carries no usable `Retry-After`.
    pub default_countdown: Duration,
    /// Longest countdown honored before giving up on the attempt.
    pub max_countdown: Duration,
    /// Pause between attempts after a transient failure.
    pub retry_delay: Duration,
    /// Spacing of countdown progress events.
    pub countdown_tick: Duration,
}

/// Fallback that downloads straight from a mirror.
#[derive(Debug, Clone)]
pub struct MirrorFallback {
    config: MirrorFallbackConfig,
    client: HttpClient,
}

enum AttemptResult {
    Done(FallbackOutcome),
    Countdown(u64),
    Retry(String),
}

impl MirrorFallback {
    #[must_use]
    pub fn new(config: MirrorFallbackConfig, client: HttpClient) -> Self {
        Self { config, client }
    }

    fn url_for(&self, hash: &str) -> String {
        self.config.url_template.replace(HASH_PLACEHOLDER, hash)
    }

    async fn attempt(
        &self,
        request: &FallbackRequest,
        url: &str,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> AttemptResult {
        let transfer = TransferRequest {
            url,
            hash: &request.hash,
            format: request.format.as_deref(),
            output_dir: &request.temp_dir,
        };

        match self.client.download(&transfer, progress, cancel).await {
            Ok(result) => AttemptResult::Done(FallbackOutcome::succeeded(result.path)),
            Err(DownloadError::HttpStatus {
                status: 429 | 503,
                retry_after,
                ..
            }) => {
                let wait = retry_after
                    .as_deref()
                    .and_then(parse_retry_after)
                    .unwrap_or(self.config.default_countdown);
                if wait > self.config.max_countdown {
                    return AttemptResult::Done(FallbackOutcome::failed(format!(
                        "mirror asked to wait {}s, longer than the {}s limit",
                        wait.as_secs(),
                        self.config.max_countdown.as_secs()
                    )));
                }
                AttemptResult::Countdown(wait.as_secs().max(1))
            }
            Err(error) if error.is_cancelled() => {
                AttemptResult::Done(FallbackOutcome::failed(error.to_string()))
            }
            Err(error) => match classify_error(&error) {
                FailureKind::TransientNetwork => AttemptResult::Retry(error.to_string()),
                _ => AttemptResult::Done(FallbackOutcome::failed(error.to_string())),
            },
        }
    }

    /// Emits countdown events until the wait is over. Returns `false` if
    /// cancelled during the wait.
    async fn wait_countdown(
        &self,
        state: CountdownState,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> bool {
        let tick = self.config.countdown_tick.max(Duration::from_millis(10));
        loop {
            let remaining = state.remaining_at(unix_now());
            let _ = progress.send(ProgressEvent::Countdown {
                remaining_seconds: remaining,
                total_seconds: state.total_seconds,
                started_at: state.started_at,
            });
            if remaining == 0 {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            tokio::time::sleep(tick.min(Duration::from_secs(remaining))).await;
        }
    }
}

#[async_trait]
impl FallbackDownloader for MirrorFallback {
    #[instrument(skip(self, request, progress, cancel), fields(hash = %request.hash))]
    async fn acquire_with_retry(
        &self,
        request: FallbackRequest,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> FallbackOutcome {
        let url = self.url_for(&request.hash);

        if let Some(state) = request.resume_countdown {
            let remaining = state.remaining_at(unix_now());
            if remaining > 0 {
                info!(remaining, "resuming interrupted countdown");
                if !self.wait_countdown(state, &progress, &cancel).await {
                    return FallbackOutcome::failed("cancelled during countdown");
                }
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::from("mirror fallback made no attempt");

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return FallbackOutcome::failed("cancelled");
            }
            let _ = progress.send(ProgressEvent::Bypassing { attempt });
            debug!(attempt, url = %url, "mirror attempt");

            match self.attempt(&request, &url, &progress, &cancel).await {
                AttemptResult::Done(outcome) => return outcome,
                AttemptResult::Countdown(seconds) => {
                    last_error = format!("mirror throttled for {seconds}s");
                    let state = CountdownState {
                        total_seconds: seconds,
                        started_at: unix_now(),
                    };
                    info!(attempt, seconds, "mirror throttled, counting down");
                    if !self.wait_countdown(state, &progress, &cancel).await {
                        return FallbackOutcome::failed("cancelled during countdown");
                    }
                }
                AttemptResult::Retry(message) => {
                    warn!(attempt, max_attempts, error = %message, "mirror attempt failed");
                    last_error = message;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        FallbackOutcome::failed(format!(
            "mirror fallback gave up after {max_attempts} attempts: {last_error}"
        ))
    }
}
