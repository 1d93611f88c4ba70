//! Primary-source quota tracking.
//!
//! Each resolution call against the primary API reports the account's daily
//! allowance. The tracker stamps that observation onto the record it was made
//! for. There is no TTL and no aggregation across hashes: [`QuotaTracker::latest`]
//! simply returns the newest observation and callers treat it as advisory.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::store::{QuotaSnapshot, RecordRepository, RecordUpdate, Result, unix_now};

/// Records and reports the primary quota.
#[derive(Clone)]
pub struct QuotaTracker {
    records: Arc<dyn RecordRepository>,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker").finish_non_exhaustive()
    }
}

impl QuotaTracker {
    #[must_use]
    pub fn new(records: Arc<dyn RecordRepository>) -> Self {
        Self { records }
    }

    /// Persists an observation for `hash`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns the store error if the record is missing or the write fails.
    #[instrument(skip(self))]
    pub async fn record(&self, hash: &str, left: i64, per_day: i64) -> Result<QuotaSnapshot> {
        let snapshot = QuotaSnapshot {
            downloads_left: left,
            downloads_per_day: per_day,
            checked_at: unix_now(),
        };
        self.records
            .apply_update(
                hash,
                RecordUpdate {
                    quota: Some(snapshot),
                    ..RecordUpdate::default()
                },
            )
            .await?;
        debug!(left, per_day, "quota observed");
        Ok(snapshot)
    }

    /// Like [`Self::record`] but only logs on failure; a lost quota
    /// observation must not fail the download attempt.
    pub async fn record_best_effort(&self, hash: &str, left: i64, per_day: i64) {
        if let Err(error) = self.record(hash, left, per_day).await {
            warn!(hash = %hash, error = %error, "failed to persist quota snapshot");
        }
    }

    /// Most recent observation across all records.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    pub async fn latest(&self) -> Result<Option<QuotaSnapshot>> {
        self.records.latest_quota().await
    }
}
