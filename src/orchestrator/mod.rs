//! Download orchestration and the record state machine.
//!
//! The [`Orchestrator`] owns path selection and retry bookkeeping:
//!
//! - a request creates (or reuses) the record for a hash;
//! - dispatch atomically claims `queued → downloading`;
//! - the primary path is tried first; quota exhaustion, API refusals and a
//!   missing primary key route to the fallback, which runs at most once at a
//!   time across all workers;
//! - quota exhaustion never counts against `retry_count`; if the fallback
//!   cannot deliver either, the record is parked as `delayed` until
//!   `next_retry_at`;
//! - a payload on disk moves the record to `done` and the post-download
//!   pipeline settles it in `available` or `error`.
//!
//! # Concurrency Model
//!
//! - Each record runs in its own Tokio task, bounded by a semaphore
//! - An in-process in-flight set plus the store's atomic claim keep a hash
//!   from being processed twice
//! - A claimed record carries a worker lease; the running task refreshes its
//!   heartbeat, and recovery only takes over records whose lease went stale
//! - Progress events flow through a channel and are applied in order before
//!   the terminal write, so a late sample can never overwrite the outcome

mod error_mapping;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::download::{CancelToken, ProgressSender, progress_channel};
use crate::fallback::{CountdownState, FallbackDownloader, FallbackRequest};
use crate::pipeline::{Pipeline, PipelineError, PipelineReport};
use crate::primary::{AcquireTarget, PrimaryAcquisition, PrimaryDownloader, PrimaryError};
use crate::store::{
    DownloadMetadata, DownloadRecord, DownloadSource, DownloadStatus, ErrorKind, Field,
    RecordStore, RecordUpdate, StoreError, unix_now,
};

use error_mapping::{build_actionable_error_message, resolution_failure_kind, transfer_failure};
use progress::apply_progress_events;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default wait before a quota-delayed record is retried.
pub const DEFAULT_QUOTA_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Default age after which a silent worker's lease may be taken over.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Floor for the heartbeat interval.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Relative difference between declared and received size that is tolerated
/// without a warning.
const SIZE_TOLERANCE: f64 = 0.05;

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("cannot cancel {hash}: it is already {status}")]
    NotCancellable { hash: String, status: DownloadStatus },

    #[error(
        "cannot reactivate {hash}: it is {status}\n  Suggestion: Only cancelled or failed records can be reactivated"
    )]
    NotReactivatable { hash: String, status: DownloadStatus },

    #[error("{hash} is already being processed")]
    Busy { hash: String },

    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for per-hash work directories.
    pub temp_dir: PathBuf,
    /// How long a quota-delayed record waits before it is re-queued.
    pub quota_retry_delay: Duration,
    /// Heartbeat age after which another worker may resume a download.
    pub lease_timeout: Duration,
}

/// Counts from one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub available: usize,
    pub failed: usize,
    pub delayed: usize,
    pub cancelled: usize,
    /// Records left in another status (for example lost to a concurrent cancel).
    pub other: usize,
}

impl RunStats {
    fn count(&mut self, status: DownloadStatus) {
        match status {
            DownloadStatus::Available => self.available += 1,
            DownloadStatus::Error => self.failed += 1,
            DownloadStatus::Delayed => self.delayed += 1,
            DownloadStatus::Cancelled => self.cancelled += 1,
            _ => self.other += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.available + self.failed + self.delayed + self.cancelled + self.other
    }
}

/// How an acquisition ended, before it is written to the record.
#[derive(Debug)]
enum Acquired {
    File {
        path: PathBuf,
        source: DownloadSource,
        bytes: u64,
    },
    Delayed {
        message: String,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

/// What to do when the fallback cannot deliver.
enum FallbackMiss {
    Delay(String),
    Fail(ErrorKind, String),
}

/// Removes a hash from the in-flight set when dropped.
struct InFlightGuard {
    map: Arc<DashMap<String, CancelToken>>,
    hash: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.hash);
    }
}

/// Drives records from request to `available`.
///
/// Cloning is cheap; clones share the store, the fallback gate and the
/// in-flight set.
#[derive(Clone)]
pub struct Orchestrator {
    store: RecordStore,
    primary: Option<PrimaryDownloader>,
    fallback: Option<Arc<dyn FallbackDownloader>>,
    fallback_gate: Arc<Semaphore>,
    pipeline: Pipeline,
    config: OrchestratorConfig,
    in_flight: Arc<DashMap<String, CancelToken>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("primary", &self.primary.is_some())
            .field("fallback", &self.fallback.is_some())
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: RecordStore, pipeline: Pipeline, config: OrchestratorConfig) -> Self {
        Self {
            store,
            primary: None,
            fallback: None,
            fallback_gate: Arc::new(Semaphore::new(1)),
            pipeline,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Enables the primary path.
    #[must_use]
    pub fn with_primary(mut self, primary: PrimaryDownloader) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Enables the fallback path.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackDownloader>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Registers interest in `hash`.
    ///
    /// A new hash gets a `queued` record. An existing record is returned as
    /// is, except a failed one, which is queued again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store fails.
    #[instrument(skip(self, metadata), fields(hash = %hash))]
    pub async fn request(
        &self,
        hash: &str,
        metadata: &DownloadMetadata,
    ) -> Result<DownloadRecord, EngineError> {
        let (record, created) = self.store.create(hash, metadata).await?;
        if created {
            info!("download requested");
            return Ok(record);
        }

        if record.status() == DownloadStatus::Error {
            info!("re-queueing failed download");
            let record = self
                .store
                .apply_update(hash, RecordUpdate::status(DownloadStatus::Queued))
                .await?;
            return Ok(record);
        }

        debug!(status = %record.status(), "existing record reused");
        Ok(record)
    }

    /// Claims and processes one queued record.
    ///
    /// Returns the record as it stands afterwards. A record that is not
    /// queued is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] if this process is already working on
    /// the hash, or a store error.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn process(&self, hash: &str) -> Result<DownloadRecord, EngineError> {
        let (guard, cancel) = self.register(hash)?;

        let Some(record) = self.store.claim(hash).await? else {
            drop(guard);
            return Ok(self.store.require(hash).await?);
        };

        let result = self.run_claimed(record, &cancel, None).await;
        drop(guard);
        result
    }

    /// Cancels a non-terminal record and aborts its transfer if one is
    /// running in this process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotCancellable`] for `available`, `cancelled`
    /// or `error` records.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn cancel(&self, hash: &str) -> Result<DownloadRecord, EngineError> {
        let record = self.store.require(hash).await?;
        let status = record.status();
        if !status.can_transition_to(DownloadStatus::Cancelled) || status == DownloadStatus::Cancelled
        {
            return Err(EngineError::NotCancellable {
                hash: hash.to_string(),
                status,
            });
        }

        if let Some(token) = self.in_flight.get(hash) {
            token.cancel();
        }

        let record = self
            .store
            .apply_update(
                hash,
                RecordUpdate {
                    status: Some(DownloadStatus::Cancelled),
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    speed: Field::Clear,
                    eta: Field::Clear,
                    ..RecordUpdate::default()
                },
            )
            .await?;
        info!("download cancelled");
        Ok(record)
    }

    /// Puts a cancelled or failed record back in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotReactivatable`] for any other status.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn reactivate(&self, hash: &str) -> Result<DownloadRecord, EngineError> {
        let record = self.store.require(hash).await?;
        let status = record.status();
        if !matches!(status, DownloadStatus::Cancelled | DownloadStatus::Error) {
            return Err(EngineError::NotReactivatable {
                hash: hash.to_string(),
                status,
            });
        }

        let record = self
            .store
            .apply_update(
                hash,
                RecordUpdate {
                    status: Some(DownloadStatus::Queued),
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    ..RecordUpdate::default()
                },
            )
            .await?;
        info!("download reactivated");
        Ok(record)
    }

    /// Runs the post-download pipeline again for a `done` or `available`
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] while the record is being processed, or
    /// the pipeline error.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn rerun_pipeline(&self, hash: &str) -> Result<PipelineReport, EngineError> {
        let (_guard, cancel) = self.register(hash)?;
        Ok(self.pipeline.run(hash, &cancel).await?)
    }

    /// Resumes records left in `downloading` by a previous run.
    ///
    /// Records stay in `downloading`; a persisted countdown is handed back to
    /// the fallback so only the remaining wait is spent. Only records whose
    /// lease is unowned, already ours, or older than the lease timeout are
    /// taken over; downloads a live worker is still heartbeating are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] or a store error.
    #[instrument(skip(self))]
    pub async fn recover(&self, concurrency: usize) -> Result<RunStats, EngineError> {
        validate_concurrency(concurrency)?;
        let records: Vec<DownloadRecord> = self
            .store
            .list_by_status(DownloadStatus::Downloading)
            .await?
            .into_iter()
            .filter(|r| !self.in_flight.contains_key(&r.hash))
            .collect();

        if records.is_empty() {
            return Ok(RunStats::default());
        }
        info!(count = records.len(), "resuming interrupted downloads");

        let stale_before = unix_now()
            - i64::try_from(self.config.lease_timeout.as_secs()).unwrap_or(i64::MAX);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::new();
        for record in records {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;
            let Ok((guard, cancel)) = self.register(&record.hash) else {
                continue;
            };
            let Some(record) = self.store.reclaim_stale(&record.hash, stale_before).await? else {
                debug!(hash = %record.hash, worker = ?record.worker_id, "lease still live, skipping");
                continue;
            };
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                let countdown =
                    CountdownState::from_columns(record.countdown_seconds, record.countdown_started_at);
                let hash = record.hash.clone();
                this.finish_task(&hash, this.run_claimed(record, &cancel, countdown).await)
                    .await
            }));
        }

        Ok(collect_stats(handles).await)
    }

    /// Processes queued records until none are left.
    ///
    /// Individual failures never fail the batch; they are recorded on the
    /// record and counted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] for a value outside
    /// 1..=100, or a store error while claiming.
    #[instrument(skip(self))]
    pub async fn run_pending(&self, concurrency: usize) -> Result<RunStats, EngineError> {
        validate_concurrency(concurrency)?;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::new();

        info!(concurrency, "processing queue");
        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;

            let Some(record) = self.store.claim_next().await? else {
                break;
            };
            let Ok((guard, cancel)) = self.register(&record.hash) else {
                // Claimed by us in the store but already tracked here; cannot happen
                // unless `process` raced on the same hash.
                continue;
            };
            debug!(hash = %record.hash, "claimed");

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                let hash = record.hash.clone();
                this.finish_task(&hash, this.run_claimed(record, &cancel, None).await)
                    .await
            }));
        }

        let stats = collect_stats(handles).await;
        info!(
            available = stats.available,
            failed = stats.failed,
            delayed = stats.delayed,
            cancelled = stats.cancelled,
            "queue processing complete"
        );
        Ok(stats)
    }

    async fn finish_task(
        &self,
        hash: &str,
        result: Result<DownloadRecord, EngineError>,
    ) -> Option<DownloadStatus> {
        match result {
            Ok(record) => Some(record.status()),
            Err(error) => {
                warn!(hash = %hash, error = %error, "download task failed");
                self.store.get(hash).await.ok().flatten().map(|r| r.status())
            }
        }
    }

    fn register(&self, hash: &str) -> Result<(InFlightGuard, CancelToken), EngineError> {
        match self.in_flight.entry(hash.to_string()) {
            Entry::Occupied(_) => Err(EngineError::Busy {
                hash: hash.to_string(),
            }),
            Entry::Vacant(slot) => {
                let token = CancelToken::new();
                slot.insert(token.clone());
                Ok((
                    InFlightGuard {
                        map: Arc::clone(&self.in_flight),
                        hash: hash.to_string(),
                    },
                    token,
                ))
            }
        }
    }

    /// Acquires and settles a record that is already `downloading`.
    async fn run_claimed(
        &self,
        record: DownloadRecord,
        cancel: &CancelToken,
        resume_countdown: Option<CountdownState>,
    ) -> Result<DownloadRecord, EngineError> {
        let hash = record.hash.clone();
        let work_dir = self.config.temp_dir.join(&hash);

        self.store
            .apply_update(
                &hash,
                RecordUpdate {
                    temp_path: Field::Set(work_dir.to_string_lossy().into_owned()),
                    ..RecordUpdate::default()
                },
            )
            .await?;

        let heartbeat = self.spawn_heartbeat(&hash);
        let (tx, rx) = progress_channel();
        let consumer = tokio::spawn(apply_progress_events(
            self.store.clone(),
            hash.clone(),
            rx,
            cancel.clone(),
        ));

        let acquired = self
            .acquire(&record, &work_dir, &tx, cancel, resume_countdown)
            .await;

        drop(tx);
        if let Err(error) = consumer.await {
            warn!(hash = %hash, error = %error, "progress task panicked");
        }

        let acquired = if cancel.is_cancelled() && !matches!(acquired, Acquired::File { .. }) {
            Acquired::Cancelled
        } else {
            acquired
        };

        let settled = self.settle_acquisition(&record, acquired).await;
        heartbeat.abort();

        match settled {
            Ok(Some(record)) if record.status() == DownloadStatus::Done => {
                match self.pipeline.run(&hash, cancel).await {
                    Ok(report) => Ok(report.record),
                    Err(PipelineError::Store(StoreError::InvalidTransition { .. })) => {
                        Ok(self.store.require(&hash).await?)
                    }
                    Err(error) => Err(error.into()),
                }
            }
            Ok(Some(record)) => Ok(record),
            Ok(None) => Ok(self.store.require(&hash).await?),
            Err(error) => Err(error),
        }
    }

    /// Keeps this worker's lease on `hash` fresh until aborted or lost.
    fn spawn_heartbeat(&self, hash: &str) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let hash = hash.to_string();
        let period = (self.config.lease_timeout / 4).max(MIN_HEARTBEAT_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(&hash).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(hash = %hash, "lease no longer held, heartbeat stopped");
                        break;
                    }
                    Err(error) => warn!(hash = %hash, error = %error, "heartbeat failed"),
                }
            }
        })
    }

    /// Writes the terminal acquisition state. `None` means the record moved
    /// on without us (typically a concurrent cancel).
    async fn settle_acquisition(
        &self,
        record: &DownloadRecord,
        acquired: Acquired,
    ) -> Result<Option<DownloadRecord>, EngineError> {
        let hash = &record.hash;
        let update = match acquired {
            Acquired::File {
                path,
                source,
                bytes,
            } => {
                warn_on_size_mismatch(hash, record.declared_size, bytes);
                let size = i64::try_from(bytes).unwrap_or(i64::MAX);
                info!(hash = %hash, %source, bytes, path = %path.display(), "download complete");
                RecordUpdate {
                    status: Some(DownloadStatus::Done),
                    downloaded_bytes: Some(size),
                    size: Field::Set(size),
                    progress: Some(100.0),
                    eta: Field::Clear,
                    speed: Field::Clear,
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    temp_path: Field::Set(path.to_string_lossy().into_owned()),
                    source: Field::Set(source),
                    error: Field::Clear,
                    error_kind: Field::Clear,
                    ..RecordUpdate::default()
                }
            }
            Acquired::Delayed { message } => {
                let next_retry_at = unix_now()
                    + i64::try_from(self.config.quota_retry_delay.as_secs()).unwrap_or(i64::MAX);
                info!(hash = %hash, next_retry_at, "quota exhausted, delaying");
                RecordUpdate {
                    status: Some(DownloadStatus::Delayed),
                    next_retry_at: Field::Set(next_retry_at),
                    error: Field::Set(message),
                    speed: Field::Clear,
                    eta: Field::Clear,
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    ..RecordUpdate::default()
                }
            }
            Acquired::Failed { kind, message } => {
                warn!(hash = %hash, %kind, error = %message, "download failed");
                RecordUpdate {
                    status: Some(DownloadStatus::Error),
                    increment_retry: true,
                    error: Field::Set(message),
                    error_kind: Field::Set(kind),
                    speed: Field::Clear,
                    eta: Field::Clear,
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    ..RecordUpdate::default()
                }
            }
            Acquired::Cancelled => {
                info!(hash = %hash, "download stopped by cancellation");
                RecordUpdate {
                    status: Some(DownloadStatus::Cancelled),
                    speed: Field::Clear,
                    eta: Field::Clear,
                    countdown_seconds: Field::Clear,
                    countdown_started_at: Field::Clear,
                    ..RecordUpdate::default()
                }
            }
        };

        match self.store.apply_update(hash, update).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::InvalidTransition { from, to, .. }) => {
                debug!(hash = %hash, %from, %to, "record moved on concurrently");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn acquire(
        &self,
        record: &DownloadRecord,
        work_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
        resume_countdown: Option<CountdownState>,
    ) -> Acquired {
        let hash = record.hash.as_str();

        if resume_countdown.is_some() && self.fallback.is_some() {
            debug!(hash = %hash, "resuming fallback countdown");
            return self
                .via_fallback(
                    record,
                    work_dir,
                    progress,
                    cancel,
                    resume_countdown,
                    FallbackMiss::Fail(ErrorKind::Transient, "fallback failed".to_string()),
                )
                .await;
        }

        let Some(primary) = &self.primary else {
            info!(hash = %hash, "no primary credential, using fallback");
            let message = build_actionable_error_message(
                "no primary credential and no fallback configured",
                ErrorKind::Configuration,
            );
            return self
                .via_fallback(
                    record,
                    work_dir,
                    progress,
                    cancel,
                    None,
                    FallbackMiss::Fail(ErrorKind::Configuration, message),
                )
                .await;
        };

        let target = AcquireTarget {
            hash,
            format: record.format.as_deref(),
            temp_dir: work_dir,
        };

        match primary.acquire(&target, progress, cancel).await {
            Ok(PrimaryAcquisition::Downloaded(result)) => Acquired::File {
                path: result.path,
                source: DownloadSource::Primary,
                bytes: result.bytes_downloaded,
            },
            Ok(PrimaryAcquisition::QuotaExhausted { message }) => {
                self.note_quota_exhaustion(hash).await;
                self.via_fallback(
                    record,
                    work_dir,
                    progress,
                    cancel,
                    None,
                    FallbackMiss::Delay(message),
                )
                .await
            }
            Ok(PrimaryAcquisition::Unavailable { message }) => {
                let message = build_actionable_error_message(
                    &format!("primary API declined: {message}"),
                    ErrorKind::Permanent,
                );
                self.via_fallback(
                    record,
                    work_dir,
                    progress,
                    cancel,
                    None,
                    FallbackMiss::Fail(ErrorKind::Permanent, message),
                )
                .await
            }
            Err(PrimaryError::Transfer(error)) => {
                if error.is_cancelled() || cancel.is_cancelled() {
                    return Acquired::Cancelled;
                }
                let (kind, message) = transfer_failure(&error);
                Acquired::Failed { kind, message }
            }
            Err(error) => {
                let kind = resolution_failure_kind(&error);
                warn!(hash = %hash, error = %error, "primary resolution failed, trying fallback");
                let message = build_actionable_error_message(&error.to_string(), kind);
                self.via_fallback(
                    record,
                    work_dir,
                    progress,
                    cancel,
                    None,
                    FallbackMiss::Fail(kind, message),
                )
                .await
            }
        }
    }

    /// Counts a quota deferral as soon as it is seen, whether or not the
    /// fallback then succeeds.
    async fn note_quota_exhaustion(&self, hash: &str) {
        let update = RecordUpdate {
            increment_delayed_retry: true,
            ..RecordUpdate::default()
        };
        if let Err(error) = self.store.apply_update(hash, update).await {
            warn!(hash = %hash, error = %error, "failed to count quota deferral");
        }
    }

    async fn via_fallback(
        &self,
        record: &DownloadRecord,
        work_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
        resume_countdown: Option<CountdownState>,
        miss: FallbackMiss,
    ) -> Acquired {
        let on_miss = |detail: Option<String>| match miss {
            FallbackMiss::Delay(message) => Acquired::Delayed {
                message: match detail {
                    Some(detail) => format!("{message}; fallback: {detail}"),
                    None => message,
                },
            },
            FallbackMiss::Fail(kind, message) => Acquired::Failed {
                kind,
                message: match detail {
                    Some(detail) => format!("{message}\n  Fallback: {detail}"),
                    None => message,
                },
            },
        };

        let Some(fallback) = &self.fallback else {
            return on_miss(None);
        };

        // One fallback acquisition system-wide.
        let Ok(_permit) = self.fallback_gate.acquire().await else {
            return on_miss(Some("fallback gate closed".to_string()));
        };
        if cancel.is_cancelled() {
            return Acquired::Cancelled;
        }

        let request = FallbackRequest {
            hash: record.hash.clone(),
            format: record.format.clone(),
            temp_dir: work_dir.to_path_buf(),
            resume_countdown,
        };
        info!(hash = %record.hash, "acquiring via fallback");
        let outcome = fallback
            .acquire_with_retry(request, progress.clone(), cancel.clone())
            .await;

        if cancel.is_cancelled() {
            return Acquired::Cancelled;
        }

        match (outcome.success, outcome.file_path) {
            (true, Some(path)) => match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() > 0 => Acquired::File {
                    path,
                    source: DownloadSource::Fallback,
                    bytes: meta.len(),
                },
                _ => on_miss(Some(format!(
                    "fallback file {} is missing or empty",
                    path.display()
                ))),
            },
            (true, None) => on_miss(Some("fallback reported success without a file".into())),
            (false, _) => on_miss(Some(
                outcome
                    .error
                    .unwrap_or_else(|| "fallback failed".to_string()),
            )),
        }
    }
}

fn validate_concurrency(concurrency: usize) -> Result<(), EngineError> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
        Ok(())
    } else {
        Err(EngineError::InvalidConcurrency { value: concurrency })
    }
}

async fn collect_stats(handles: Vec<tokio::task::JoinHandle<Option<DownloadStatus>>>) -> RunStats {
    let mut stats = RunStats::default();
    for handle in handles {
        match handle.await {
            Ok(Some(status)) => stats.count(status),
            Ok(None) => stats.other += 1,
            Err(error) => {
                warn!(error = %error, "download task panicked");
                stats.other += 1;
            }
        }
    }
    stats
}

#[allow(clippy::cast_precision_loss)]
fn warn_on_size_mismatch(hash: &str, declared: Option<i64>, actual: u64) {
    let Some(declared) = declared.filter(|d| *d > 0) else {
        return;
    };
    let declared_f = declared as f64;
    let difference = (actual as f64 - declared_f).abs() / declared_f;
    if difference > SIZE_TOLERANCE {
        warn!(hash = %hash, declared, actual, "downloaded size differs from declared size");
    }
}
