//! Repository seam for record persistence.
//!
//! Scheduling and orchestration code depends on this boundary rather than on
//! the concrete `SQLite` store.

use async_trait::async_trait;

use super::{DownloadRecord, DownloadStatus, QuotaSnapshot, RecordStore, RecordUpdate, Result};

/// Data-access contract for download records.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Reads a record by hash.
    async fn get(&self, hash: &str) -> Result<Option<DownloadRecord>>;

    /// Merges an update into an existing record.
    async fn apply_update(&self, hash: &str, update: RecordUpdate) -> Result<DownloadRecord>;

    /// Returns all records in a status.
    async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>>;

    /// Returns delayed records whose retry time has passed.
    async fn list_due_delayed(&self, now: i64) -> Result<Vec<DownloadRecord>>;

    /// Returns the newest quota snapshot across records.
    async fn latest_quota(&self) -> Result<Option<QuotaSnapshot>>;
}

#[async_trait]
impl RecordRepository for RecordStore {
    async fn get(&self, hash: &str) -> Result<Option<DownloadRecord>> {
        RecordStore::get(self, hash).await
    }

    async fn apply_update(&self, hash: &str, update: RecordUpdate) -> Result<DownloadRecord> {
        RecordStore::apply_update(self, hash, update).await
    }

    async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        RecordStore::list_by_status(self, status).await
    }

    async fn list_due_delayed(&self, now: i64) -> Result<Vec<DownloadRecord>> {
        RecordStore::list_due_delayed(self, now).await
    }

    async fn latest_quota(&self) -> Result<Option<QuotaSnapshot>> {
        RecordStore::latest_quota(self).await
    }
}
