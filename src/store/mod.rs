//! Durable record store for download lifecycle state.
//!
//! One row per content hash, backed by `SQLite`. Rows are created once and
//! never deleted; every later mutation goes through [`RecordStore::apply_update`]
//! so the lifecycle graph and progress rules live in a single place
//! ([`RecordUpdate::apply_to`]).
//!
//! # Example
//!
//! ```ignore
//! use hashfetch_core::store::{DownloadMetadata, RecordStore};
//! use hashfetch_core::Database;
//! use std::path::Path;
//!
//! let db = Database::new(Path::new("hashfetch.db")).await?;
//! let store = RecordStore::new(db);
//!
//! let (record, created) = store.create("d41d8cd98f00b204e9800998ecf8427e", &DownloadMetadata::default()).await?;
//! if let Some(claimed) = store.claim(&record.hash).await? {
//!     // ... acquire bytes ...
//! }
//! ```

mod error;
mod record;
mod repository;

pub use error::{StoreDbErrorKind, StoreError};
pub use record::{
    DownloadMetadata, DownloadPhase, DownloadRecord, DownloadSource, DownloadStatus, ErrorKind,
    Field, QuotaSnapshot, RecordUpdate, UploadStatus,
};
pub use repository::RecordRepository;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Re-read and re-merge attempts before a contended update gives up.
const MAX_WRITE_ATTEMPTS: usize = 16;

/// Current wall-clock time as unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Record store over the `downloads` table.
///
/// Cloning is cheap; clones share the pool, the write lock and the worker
/// identity, so read-merge-write updates from one process are applied
/// strictly in order. Writers in other processes are detected through the
/// row `revision`: a write only lands on the revision it was merged against.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
    write_lock: Arc<Mutex<()>>,
    worker_id: Arc<str>,
}

impl RecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        let worker_id = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
            worker_id: worker_id.into(),
        }
    }

    /// Identity stamped on records this store claims.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Creates the record for `hash` in `queued` unless one already exists.
    ///
    /// Returns the stored record and whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert or read fails.
    #[instrument(skip(self, metadata), fields(hash = %hash))]
    pub async fn create(
        &self,
        hash: &str,
        metadata: &DownloadMetadata,
    ) -> Result<(DownloadRecord, bool)> {
        let now = unix_now();
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r"INSERT INTO downloads (
                hash, title, filename, author, publisher, language, format,
                declared_size, status, queued_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(hash) DO NOTHING",
        )
        .bind(hash)
        .bind(metadata.title.as_deref())
        .bind(metadata.filename.as_deref())
        .bind(metadata.author.as_deref())
        .bind(metadata.publisher.as_deref())
        .bind(metadata.language.as_deref())
        .bind(metadata.format.as_deref())
        .bind(metadata.declared_size)
        .bind(DownloadStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        let created = result.rows_affected() > 0;
        let record = self.require(hash).await?;
        debug!(created, status = %record.status(), "download record ready");
        Ok((record, created))
    }

    /// Gets a record by hash.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, hash: &str) -> Result<Option<DownloadRecord>> {
        let record =
            sqlx::query_as::<_, DownloadRecord>(r"SELECT * FROM downloads WHERE hash = ?")
                .bind(hash)
                .fetch_optional(self.db.pool())
                .await?;

        Ok(record)
    }

    /// Gets a record by hash, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record exists.
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn require(&self, hash: &str) -> Result<DownloadRecord> {
        self.get(hash)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound(hash.to_string()))
    }

    /// Lists records in a status, oldest request first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads WHERE status = ? ORDER BY queued_at ASC, hash ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Lists the most recently touched records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads ORDER BY updated_at DESC, hash ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Counts records by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: DownloadStatus) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(r"SELECT COUNT(*) FROM downloads WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(count)
    }

    /// Atomically claims a queued record for download.
    ///
    /// The `queued → downloading` move happens in a single statement, so two
    /// workers (or two processes sharing the database) can never both win the
    /// same hash. The claim stamps this store's lease; progress and the
    /// previous attempt's error are reset. Returns `None` when the record is
    /// not queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn claim(&self, hash: &str) -> Result<Option<DownloadRecord>> {
        let now = unix_now();
        let _guard = self.write_lock.lock().await;

        let record = sqlx::query_as::<_, DownloadRecord>(
            r"UPDATE downloads
              SET status = ?,
                  started_at = COALESCE(started_at, ?),
                  downloaded_bytes = 0,
                  progress = 0,
                  speed = NULL,
                  eta = NULL,
                  phase = NULL,
                  error = NULL,
                  error_kind = NULL,
                  worker_id = ?,
                  heartbeat_at = ?,
                  revision = revision + 1,
                  updated_at = ?
              WHERE hash = ? AND status = ?
              RETURNING *",
        )
        .bind(DownloadStatus::Downloading.as_str())
        .bind(now)
        .bind(&*self.worker_id)
        .bind(now)
        .bind(now)
        .bind(hash)
        .bind(DownloadStatus::Queued.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Claims the oldest queued record, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<DownloadRecord>> {
        let next: Option<(String,)> = sqlx::query_as(
            r"SELECT hash FROM downloads WHERE status = ? ORDER BY queued_at ASC, hash ASC LIMIT 1",
        )
        .bind(DownloadStatus::Queued.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        match next {
            // Lost races return None from claim; the caller just polls again.
            Some((hash,)) => self.claim(&hash).await,
            None => Ok(None),
        }
    }

    /// Applies a partial update to the record for `hash`.
    ///
    /// Reads the current row, merges via [`RecordUpdate::apply_to`] and writes
    /// it back only if no other writer changed the row in between. On a lost
    /// race the fresh row is re-read and the update merged again, so a
    /// concurrent terminal status (say, a cancel from another process) is
    /// never overwritten by a stale copy. Returns the merged record.
    ///
    /// Writes made by the lease holder also refresh its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record exists,
    /// [`StoreError::InvalidTransition`] / [`StoreError::MissingRetryTime`] if
    /// the merge is rejected, [`StoreError::WriteConflict`] if the row kept
    /// changing, or [`StoreError::Database`] if IO fails.
    #[instrument(skip(self, update), fields(hash = %hash, status = ?update.status))]
    pub async fn apply_update(&self, hash: &str, update: RecordUpdate) -> Result<DownloadRecord> {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut record = self.require(hash).await?;
            let expected = record.revision;
            let now = unix_now();
            update.clone().apply_to(&mut record, now)?;
            record.revision = expected + 1;
            if record.worker_id.as_deref() == Some(&*self.worker_id) {
                record.heartbeat_at = Some(now);
            }

            if self.write_record(&record, expected).await? {
                return Ok(record);
            }
            debug!(attempt, "record changed concurrently, merging again");
        }

        warn!("giving up on contended record update");
        Err(StoreError::WriteConflict(hash.to_string()))
    }

    /// Writes `record` if the stored row is still at revision `expected`.
    async fn write_record(&self, record: &DownloadRecord, expected: i64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = ?,
                  started_at = ?,
                  completed_at = ?,
                  downloaded_bytes = ?,
                  size = ?,
                  progress = ?,
                  speed = ?,
                  eta = ?,
                  phase = ?,
                  retry_count = ?,
                  delayed_retry_count = ?,
                  next_retry_at = ?,
                  countdown_seconds = ?,
                  countdown_started_at = ?,
                  downloads_left = ?,
                  downloads_per_day = ?,
                  quota_checked_at = ?,
                  temp_path = ?,
                  final_path = ?,
                  error = ?,
                  error_kind = ?,
                  source = ?,
                  upload_status = ?,
                  uploaded_at = ?,
                  upload_error = ?,
                  heartbeat_at = ?,
                  revision = ?,
                  updated_at = ?
              WHERE hash = ? AND revision = ?",
        )
        .bind(&record.status_str)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.downloaded_bytes)
        .bind(record.size)
        .bind(record.progress)
        .bind(record.speed.as_deref())
        .bind(record.eta)
        .bind(record.phase_str.as_deref())
        .bind(record.retry_count)
        .bind(record.delayed_retry_count)
        .bind(record.next_retry_at)
        .bind(record.countdown_seconds)
        .bind(record.countdown_started_at)
        .bind(record.downloads_left)
        .bind(record.downloads_per_day)
        .bind(record.quota_checked_at)
        .bind(record.temp_path.as_deref())
        .bind(record.final_path.as_deref())
        .bind(record.error.as_deref())
        .bind(record.error_kind_str.as_deref())
        .bind(record.source_str.as_deref())
        .bind(record.upload_status_str.as_deref())
        .bind(record.uploaded_at)
        .bind(record.upload_error.as_deref())
        .bind(record.heartbeat_at)
        .bind(record.revision)
        .bind(record.updated_at)
        .bind(&record.hash)
        .bind(expected)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Refreshes this store's lease on a downloading record.
    ///
    /// Returns `false` when the record is no longer downloading under this
    /// store's lease.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn heartbeat(&self, hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET heartbeat_at = ?
              WHERE hash = ? AND worker_id = ? AND status = ?",
        )
        .bind(unix_now())
        .bind(hash)
        .bind(&*self.worker_id)
        .bind(DownloadStatus::Downloading.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Takes over a downloading record whose lease went stale.
    ///
    /// Succeeds only when nobody holds the lease, this store already holds
    /// it, or the holder's last heartbeat is at or before `stale_before`.
    /// The check and the takeover are one statement, so two recovering
    /// processes cannot both win. Returns `None` when a live worker owns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(
        &self,
        hash: &str,
        stale_before: i64,
    ) -> Result<Option<DownloadRecord>> {
        let now = unix_now();
        let _guard = self.write_lock.lock().await;

        let record = sqlx::query_as::<_, DownloadRecord>(
            r"UPDATE downloads
              SET worker_id = ?,
                  heartbeat_at = ?,
                  revision = revision + 1,
                  updated_at = ?
              WHERE hash = ? AND status = ?
                AND (worker_id IS NULL
                     OR worker_id = ?
                     OR heartbeat_at IS NULL
                     OR heartbeat_at <= ?)
              RETURNING *",
        )
        .bind(&*self.worker_id)
        .bind(now)
        .bind(now)
        .bind(hash)
        .bind(DownloadStatus::Downloading.as_str())
        .bind(&*self.worker_id)
        .bind(stale_before)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Lists delayed records whose retry time is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_due_delayed(&self, now: i64) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads
              WHERE status = ? AND next_retry_at <= ?
              ORDER BY next_retry_at ASC",
        )
        .bind(DownloadStatus::Delayed.as_str())
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Returns the most recently observed quota across all records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn latest_quota(&self) -> Result<Option<QuotaSnapshot>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r"SELECT downloads_left, downloads_per_day, quota_checked_at
              FROM downloads
              WHERE quota_checked_at IS NOT NULL
                AND downloads_left IS NOT NULL
                AND downloads_per_day IS NOT NULL
              ORDER BY quota_checked_at DESC
              LIMIT 1",
        )
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(
            |(downloads_left, downloads_per_day, checked_at)| QuotaSnapshot {
                downloads_left,
                downloads_per_day,
                checked_at,
            },
        ))
    }
}
