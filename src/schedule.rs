//! Re-queueing of parked and failed records.
//!
//! The state machine never moves a record out of `delayed` or `error` on its
//! own. The [`Scheduler`] does, from the outside:
//!
//! - `delayed` records whose `next_retry_at` has passed go back to `queued`;
//! - `error` records with a transient [`ErrorKind`] go back to `queued` once
//!   the retry backoff since their last update has elapsed, until
//!   `retry_count` reaches the policy's budget.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::download::{FailureKind, RetryDecision, RetryPolicy};
use crate::store::{DownloadStatus, ErrorKind, RecordRepository, RecordUpdate, Result};

/// What one scheduling pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub promoted_delayed: usize,
    pub requeued_failed: usize,
}

/// Promotes due records back to `queued`.
#[derive(Clone)]
pub struct Scheduler {
    records: Arc<dyn RecordRepository>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(records: Arc<dyn RecordRepository>, policy: RetryPolicy) -> Self {
        Self { records, policy }
    }

    /// Runs both promotions at `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns the store error if listing fails.
    pub async fn tick(&self, now: i64) -> Result<ScheduleReport> {
        Ok(ScheduleReport {
            promoted_delayed: self.promote_due_delayed(now).await?,
            requeued_failed: self.requeue_retryable_failures(now).await?,
        })
    }

    /// Moves `delayed` records whose retry time has come to `queued`.
    ///
    /// # Errors
    ///
    /// Returns the store error if listing fails. Failures on individual
    /// records are logged and skipped.
    #[instrument(skip(self))]
    pub async fn promote_due_delayed(&self, now: i64) -> Result<usize> {
        let due = self.records.list_due_delayed(now).await?;
        let mut promoted = 0;
        for record in due {
            match self
                .records
                .apply_update(&record.hash, RecordUpdate::status(DownloadStatus::Queued))
                .await
            {
                Ok(_) => {
                    debug!(hash = %record.hash, "delayed record re-queued");
                    promoted += 1;
                }
                Err(error) => warn!(hash = %record.hash, error = %error, "failed to re-queue"),
            }
        }
        if promoted > 0 {
            info!(promoted, "promoted delayed records");
        }
        Ok(promoted)
    }

    /// Re-queues transient failures that are within budget and past backoff.
    ///
    /// # Errors
    ///
    /// Returns the store error if listing fails.
    #[instrument(skip(self))]
    pub async fn requeue_retryable_failures(&self, now: i64) -> Result<usize> {
        let failed = self.records.list_by_status(DownloadStatus::Error).await?;
        let mut requeued = 0;

        for record in failed {
            let kind = record.error_kind().unwrap_or(ErrorKind::Permanent);
            let attempts = u32::try_from(record.retry_count).unwrap_or(u32::MAX);

            let delay = match self.policy.should_retry(FailureKind::from(kind), attempts) {
                RetryDecision::Retry { delay, .. } => delay,
                RetryDecision::DoNotRetry { reason } => {
                    debug!(hash = %record.hash, reason = %reason, "not retrying");
                    continue;
                }
            };

            let due_at = record
                .updated_at
                .saturating_add(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX));
            if due_at > now {
                continue;
            }

            match self
                .records
                .apply_update(&record.hash, RecordUpdate::status(DownloadStatus::Queued))
                .await
            {
                Ok(_) => {
                    debug!(hash = %record.hash, retry_count = record.retry_count, "failed record re-queued");
                    requeued += 1;
                }
                Err(error) => warn!(hash = %record.hash, error = %error, "failed to re-queue"),
            }
        }
        if requeued > 0 {
            info!(requeued, "re-queued failed records");
        }
        Ok(requeued)
    }
}
