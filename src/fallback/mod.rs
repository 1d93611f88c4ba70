//! Fallback acquisition contract.
//!
//! The fallback path is slow and protected against automation; how it gets
//! past that protection is its own business. The engine only relies on the
//! [`FallbackDownloader`] contract: hand over a hash, receive progress events
//! (bypass attempts, countdown waits, byte progress) and a final
//! [`FallbackOutcome`]. At most one fallback acquisition runs at a time; the
//! orchestrator enforces that.
//!
//! [`MirrorFallback`] is the implementation shipped with the crate.

mod mirror;

pub use mirror::{HASH_PLACEHOLDER, MirrorFallback, MirrorFallbackConfig};

use std::path::PathBuf;

use async_trait::async_trait;

use crate::download::{CancelToken, ProgressSender};

/// Countdown persisted on the record so a restart resumes the remaining wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownState {
    pub total_seconds: u64,
    /// Unix seconds.
    pub started_at: i64,
}

impl CountdownState {
    /// Seconds still to wait at `now` (unix seconds).
    #[must_use]
    pub fn remaining_at(&self, now: i64) -> u64 {
        let elapsed = u64::try_from(now.saturating_sub(self.started_at)).unwrap_or(0);
        self.total_seconds.saturating_sub(elapsed)
    }

    /// Builds the state from the record's countdown columns.
    #[must_use]
    pub fn from_columns(seconds: Option<i64>, started_at: Option<i64>) -> Option<Self> {
        let total_seconds = u64::try_from(seconds?).ok()?;
        Some(Self {
            total_seconds,
            started_at: started_at?,
        })
    }
}

/// Input to one fallback acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub hash: String,
    pub format: Option<String>,
    pub temp_dir: PathBuf,
    /// Countdown interrupted by a restart, if any.
    pub resume_countdown: Option<CountdownState>,
}

/// Final answer from the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOutcome {
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl FallbackOutcome {
    #[must_use]
    pub fn succeeded(file_path: PathBuf) -> Self {
        Self {
            success: true,
            file_path: Some(file_path),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            file_path: None,
            error: Some(error.into()),
        }
    }
}

/// Slow-path acquisition with its own internal retries.
#[async_trait]
pub trait FallbackDownloader: Send + Sync {
    /// Acquires `request.hash`, retrying internally, reporting through
    /// `progress` and stopping early once `cancel` is set.
    async fn acquire_with_retry(
        &self,
        request: FallbackRequest,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> FallbackOutcome;
}
