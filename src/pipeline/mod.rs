//! Post-download pipeline.
//!
//! Runs once a record reaches `done` (or again on demand for an `available`
//! record). Four independently toggled steps run in a fixed order:
//!
//! 1. place in the destination directory (move);
//! 2. upload to the library;
//! 3. place in the indexer directory, optionally under a category subfolder
//!    (copy when the destination already holds the file, move otherwise);
//! 4. delete the temp file.
//!
//! When upload is enabled the record is marked `upload_status = pending` as
//! the run starts, so a run interrupted before the upload is visible as such.
//!
//! A failing step never stops the later ones. Only a destination failure
//! turns the record into `error`; upload failures are kept in
//! `upload_status` / `upload_error` and indexer or cleanup failures are
//! logged. Cancellation is checked before each step and leaves already
//! committed effects in place.

mod placement;
mod upload;

pub use placement::{PlacementError, PlacementMode, place_file, place_file_with};
pub use upload::{
    AccessToken, CredentialProvider, LibraryUploader, StaticCredential,
    TOKEN_REFRESH_BUFFER_SECS, UploadConfig, UploadError,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::{CancelToken, sanitize_filename};
use crate::store::{
    DownloadRecord, DownloadStatus, ErrorKind, Field, RecordRepository, RecordUpdate, StoreError,
    UploadStatus, unix_now,
};

/// Which steps run and where files go.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub place_in_destination: bool,
    pub destination_dir: PathBuf,
    pub upload: bool,
    pub place_in_indexer: bool,
    pub indexer_dir: PathBuf,
    /// Subfolder under `indexer_dir`, e.g. a category label.
    pub indexer_category: Option<String>,
    pub delete_temp: bool,
}

/// Errors that stop the pipeline before any step runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record {hash} is {status}; the pipeline needs a done or available record")]
    NotReady { hash: String, status: DownloadStatus },

    #[error("record {hash} has no downloaded file to process")]
    NoArtifact { hash: String },
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StepOutcome {
    #[default]
    Skipped,
    Succeeded,
    Failed(String),
}

impl StepOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What one pipeline run did.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub record: DownloadRecord,
    pub destination: StepOutcome,
    pub upload: StepOutcome,
    pub indexer: StepOutcome,
    pub temp_cleanup: StepOutcome,
    pub cancelled: bool,
}

/// Executes the post-download steps and records their outcomes.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    uploader: Option<LibraryUploader>,
    records: Arc<dyn RecordRepository>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}

/// Mutable state threaded through the steps.
struct RunState {
    working: PathBuf,
    final_path: Option<PathBuf>,
    in_destination: bool,
    report: PipelineReport,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        uploader: Option<LibraryUploader>,
        records: Arc<dyn RecordRepository>,
    ) -> Self {
        Self {
            config,
            uploader,
            records,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every enabled step for `hash` and settles the record.
    ///
    /// A `done` record ends in `available`, or `error` if destination
    /// placement failed. An `available` record stays `available`; a re-run
    /// starts from `final_path`, so files already in place are not duplicated.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the record is missing, not in a runnable
    /// status, has no file, or the store rejects the final write.
    #[instrument(skip(self, cancel), fields(hash = %hash))]
    pub async fn run(&self, hash: &str, cancel: &CancelToken) -> Result<PipelineReport, PipelineError> {
        let record = self
            .records
            .get(hash)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound(hash.to_string()))?;

        let status = record.status();
        if !matches!(status, DownloadStatus::Done | DownloadStatus::Available) {
            return Err(PipelineError::NotReady {
                hash: hash.to_string(),
                status,
            });
        }

        let source = artifact_path(&record).ok_or_else(|| PipelineError::NoArtifact {
            hash: hash.to_string(),
        })?;
        let declared = record.declared_size.and_then(|s| u64::try_from(s).ok());
        let already_placed = record.final_path.as_deref().map(PathBuf::from);

        let mut state = RunState {
            working: source,
            final_path: already_placed,
            in_destination: false,
            report: PipelineReport {
                record,
                destination: StepOutcome::Skipped,
                upload: StepOutcome::Skipped,
                indexer: StepOutcome::Skipped,
                temp_cleanup: StepOutcome::Skipped,
                cancelled: false,
            },
        };

        if self.config.upload && !cancel.is_cancelled() {
            self.mark_upload_pending(hash).await;
        }

        'steps: {
            if self.config.place_in_destination {
                if cancel.is_cancelled() {
                    break 'steps;
                }
                self.place_in_destination(&mut state, declared).await;
            }
            if self.config.upload {
                if cancel.is_cancelled() {
                    break 'steps;
                }
                self.upload(hash, &mut state).await;
            }
            if self.config.place_in_indexer {
                if cancel.is_cancelled() {
                    break 'steps;
                }
                self.place_in_indexer(&mut state, declared).await;
            }
            if self.config.delete_temp {
                if cancel.is_cancelled() {
                    break 'steps;
                }
                delete_temp(&mut state).await;
            }
        }
        state.report.cancelled = cancel.is_cancelled();

        self.settle(hash, status, state).await
    }

    async fn place_in_destination(&self, state: &mut RunState, declared: Option<u64>) {
        let dir = self.config.destination_dir.clone();
        match place_blocking(state.working.clone(), dir, PlacementMode::Move, declared).await {
            Ok(placed) => {
                info!(path = %placed.display(), "placed in destination");
                state.working.clone_from(&placed);
                state.final_path = Some(placed);
                state.in_destination = true;
                state.report.destination = StepOutcome::Succeeded;
            }
            Err(message) => {
                warn!(error = %message, "destination placement failed");
                state.report.destination = StepOutcome::Failed(message);
            }
        }
    }

    async fn mark_upload_pending(&self, hash: &str) {
        let update = RecordUpdate {
            upload_status: Field::Set(UploadStatus::Pending),
            upload_error: Field::Clear,
            ..RecordUpdate::default()
        };
        if let Err(error) = self.records.apply_update(hash, update).await {
            warn!(error = %error, "failed to persist pending upload");
        }
    }

    async fn upload(&self, hash: &str, state: &mut RunState) {
        let Some(uploader) = &self.uploader else {
            let message = "upload enabled but no library endpoint configured";
            self.write_upload_result(hash, Err(message)).await;
            state.report.upload = StepOutcome::Failed(message.to_string());
            return;
        };

        if let Err(error) = self
            .records
            .apply_update(
                hash,
                RecordUpdate {
                    upload_status: Field::Set(UploadStatus::Uploading),
                    upload_error: Field::Clear,
                    ..RecordUpdate::default()
                },
            )
            .await
        {
            warn!(error = %error, "failed to persist upload start");
        }

        match uploader.upload(&state.working).await {
            Ok(()) => {
                state.report.upload = StepOutcome::Succeeded;
                self.write_upload_result(hash, Ok(())).await;
            }
            Err(error) => {
                let message = error.to_string();
                warn!(error = %message, "library upload failed");
                self.write_upload_result(hash, Err(&message)).await;
                state.report.upload = StepOutcome::Failed(message);
            }
        }
    }

    async fn write_upload_result(&self, hash: &str, result: Result<(), &str>) {
        let update = match result {
            Ok(()) => RecordUpdate {
                upload_status: Field::Set(UploadStatus::Completed),
                uploaded_at: Field::Set(unix_now()),
                upload_error: Field::Clear,
                ..RecordUpdate::default()
            },
            Err(message) => RecordUpdate {
                upload_status: Field::Set(UploadStatus::Failed),
                upload_error: Field::Set(message.to_string()),
                ..RecordUpdate::default()
            },
        };
        if let Err(error) = self.records.apply_update(hash, update).await {
            warn!(error = %error, "failed to persist upload outcome");
        }
    }

    async fn place_in_indexer(&self, state: &mut RunState, declared: Option<u64>) {
        let mut dir = self.config.indexer_dir.clone();
        if let Some(category) = self
            .config
            .indexer_category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            dir.push(sanitize_filename(category));
        }

        let mode = if state.in_destination {
            PlacementMode::Copy
        } else {
            PlacementMode::Move
        };

        match place_blocking(state.working.clone(), dir, mode, declared).await {
            Ok(placed) => {
                info!(path = %placed.display(), ?mode, "placed in indexer");
                if mode == PlacementMode::Move {
                    state.working.clone_from(&placed);
                    state.final_path = Some(placed);
                }
                state.report.indexer = StepOutcome::Succeeded;
            }
            Err(message) => {
                warn!(error = %message, "indexer placement failed");
                state.report.indexer = StepOutcome::Failed(message);
            }
        }
    }

    async fn settle(
        &self,
        hash: &str,
        status: DownloadStatus,
        mut state: RunState,
    ) -> Result<PipelineReport, PipelineError> {
        let final_path = state
            .final_path
            .clone()
            .unwrap_or_else(|| state.working.clone());
        let final_path = final_path.to_string_lossy().into_owned();

        let update = if let StepOutcome::Failed(message) = &state.report.destination {
            let next = if status == DownloadStatus::Done {
                DownloadStatus::Error
            } else {
                // An available record keeps its status; the failure is still visible.
                status
            };
            RecordUpdate {
                status: Some(next),
                error: Field::Set(format!("destination placement failed: {message}")),
                error_kind: Field::Set(ErrorKind::Filesystem),
                ..RecordUpdate::default()
            }
        } else if state.report.cancelled && status == DownloadStatus::Done {
            RecordUpdate {
                status: Some(DownloadStatus::Cancelled),
                final_path: state
                    .final_path
                    .as_ref()
                    .map_or(Field::Keep, |p| Field::Set(p.to_string_lossy().into_owned())),
                ..RecordUpdate::default()
            }
        } else {
            RecordUpdate {
                status: Some(DownloadStatus::Available),
                final_path: Field::Set(final_path),
                error: Field::Clear,
                error_kind: Field::Clear,
                ..RecordUpdate::default()
            }
        };

        let record = self.records.apply_update(hash, update).await?;
        debug!(status = %record.status(), "pipeline settled");
        state.report.record = record;
        Ok(state.report)
    }
}

/// File the pipeline starts from: the placed file on a re-run, else the temp file.
fn artifact_path(record: &DownloadRecord) -> Option<PathBuf> {
    let placed = record
        .final_path
        .as_deref()
        .map(PathBuf::from)
        .filter(|p| p.is_file());
    placed.or_else(|| {
        record
            .temp_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.is_file())
    })
}

async fn place_blocking(
    source: PathBuf,
    dir: PathBuf,
    mode: PlacementMode,
    declared: Option<u64>,
) -> Result<PathBuf, String> {
    match tokio::task::spawn_blocking(move || place_file(&source, &dir, mode, declared)).await {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(error)) => Err(error.to_string()),
        Err(error) => Err(format!("placement task failed: {error}")),
    }
}

async fn delete_temp(state: &mut RunState) {
    let temp = state.report.record.temp_path.as_deref().map(PathBuf::from);
    let Some(temp) = temp else {
        return;
    };

    if temp == state.working {
        warn!(path = %temp.display(), "temp file is the only copy, keeping it");
        state.report.temp_cleanup = StepOutcome::Failed("temp file is the only copy".into());
        return;
    }

    if temp.is_file() {
        if let Err(error) = tokio::fs::remove_file(&temp).await {
            warn!(path = %temp.display(), error = %error, "failed to delete temp file");
            state.report.temp_cleanup = StepOutcome::Failed(error.to_string());
            return;
        }
    }
    remove_empty_parent(&temp).await;
    state.report.temp_cleanup = StepOutcome::Succeeded;
}

/// Removes the per-hash work directory once it is empty.
async fn remove_empty_parent(file: &Path) {
    if let Some(parent) = file.parent() {
        // Fails harmlessly when the directory still has entries.
        let _ = tokio::fs::remove_dir(parent).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::{DownloadMetadata, RecordStore};
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: RecordStore,
    }

    async fn done_record(body: &[u8]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        store
            .create(HASH, &DownloadMetadata::default())
            .await
            .unwrap();
        store.claim(HASH).await.unwrap().unwrap();

        let work = root.join("tmp").join(HASH);
        std::fs::create_dir_all(&work).unwrap();
        let file = work.join("Title - Author.pdf");
        std::fs::write(&file, body).unwrap();

        store
            .apply_update(
                HASH,
                RecordUpdate {
                    status: Some(DownloadStatus::Done),
                    temp_path: Field::Set(file.to_string_lossy().into_owned()),
                    ..RecordUpdate::default()
                },
            )
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            root,
            store,
        }
    }

    fn pipeline(fx: &Fixture, config: PipelineConfig) -> Pipeline {
        Pipeline::new(config, None, Arc::new(fx.store.clone()))
    }

    fn destination_only(fx: &Fixture) -> PipelineConfig {
        PipelineConfig {
            place_in_destination: true,
            destination_dir: fx.root.join("library"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_destination_sets_available_and_final_path() {
        let fx = done_record(b"payload").await;
        let report = pipeline(&fx, destination_only(&fx))
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.record.status(), DownloadStatus::Available);
        let final_path = PathBuf::from(report.record.final_path.clone().unwrap());
        assert_eq!(final_path, fx.root.join("library/Title - Author.pdf"));
        assert!(final_path.exists());
        assert_eq!(report.destination, StepOutcome::Succeeded);
        assert!(report.record.upload_status().is_none(), "upload step disabled");
    }

    #[tokio::test]
    async fn test_pipeline_destination_failure_sets_error() {
        let fx = done_record(b"payload").await;
        let blocker = fx.root.join("not-a-dir");
        std::fs::write(&blocker, b"file in the way").unwrap();
        let config = PipelineConfig {
            place_in_destination: true,
            destination_dir: blocker,
            ..PipelineConfig::default()
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.record.status(), DownloadStatus::Error);
        assert_eq!(report.record.error_kind(), Some(ErrorKind::Filesystem));
        assert!(report.destination.is_failed());
    }

    #[tokio::test]
    async fn test_pipeline_indexer_copies_after_destination() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            place_in_indexer: true,
            indexer_dir: fx.root.join("indexer"),
            indexer_category: Some("Sci/Fi".to_string()),
            ..destination_only(&fx)
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert!(fx.root.join("library/Title - Author.pdf").exists());
        assert!(fx.root.join("indexer/Sci_Fi/Title - Author.pdf").exists());
        assert_eq!(
            PathBuf::from(report.record.final_path.unwrap()),
            fx.root.join("library/Title - Author.pdf")
        );
    }

    #[tokio::test]
    async fn test_pipeline_indexer_only_moves_and_becomes_final() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            place_in_indexer: true,
            indexer_dir: fx.root.join("indexer"),
            ..PipelineConfig::default()
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        let final_path = PathBuf::from(report.record.final_path.unwrap());
        assert_eq!(final_path, fx.root.join("indexer/Title - Author.pdf"));
        assert!(!fx.root.join("tmp").join(HASH).join("Title - Author.pdf").exists());
    }

    #[tokio::test]
    async fn test_pipeline_delete_temp_removes_work_dir() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            place_in_indexer: true,
            indexer_dir: fx.root.join("indexer"),
            delete_temp: true,
            ..destination_only(&fx)
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.temp_cleanup, StepOutcome::Succeeded);
        assert!(!fx.root.join("tmp").join(HASH).exists());
    }

    #[tokio::test]
    async fn test_pipeline_no_steps_keeps_temp_as_final() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            delete_temp: true,
            ..PipelineConfig::default()
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.record.status(), DownloadStatus::Available);
        assert!(report.temp_cleanup.is_failed(), "only copy is never deleted");
        assert!(PathBuf::from(report.record.final_path.unwrap()).exists());
    }

    #[tokio::test]
    async fn test_pipeline_rerun_on_available_does_not_duplicate() {
        let fx = done_record(b"payload").await;
        let pipeline = pipeline(&fx, destination_only(&fx));
        pipeline.run(HASH, &CancelToken::new()).await.unwrap();

        let report = pipeline.run(HASH, &CancelToken::new()).await.unwrap();

        assert_eq!(report.record.status(), DownloadStatus::Available);
        let entries = std::fs::read_dir(fx.root.join("library")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_pipeline_upload_enabled_without_uploader_fails_step_only() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            upload: true,
            ..destination_only(&fx)
        };

        let report = pipeline(&fx, config)
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.record.status(), DownloadStatus::Available);
        assert_eq!(report.record.upload_status(), Some(UploadStatus::Failed));
        assert!(report.record.upload_error.is_some());
    }

    /// Repository that remembers every upload status written through it.
    struct UploadStatusLog {
        inner: RecordStore,
        seen: std::sync::Mutex<Vec<UploadStatus>>,
    }

    #[async_trait::async_trait]
    impl RecordRepository for UploadStatusLog {
        async fn get(&self, hash: &str) -> crate::store::Result<Option<DownloadRecord>> {
            self.inner.get(hash).await
        }

        async fn apply_update(
            &self,
            hash: &str,
            update: RecordUpdate,
        ) -> crate::store::Result<DownloadRecord> {
            if let Field::Set(status) = &update.upload_status {
                self.seen.lock().unwrap().push(*status);
            }
            self.inner.apply_update(hash, update).await
        }

        async fn list_by_status(
            &self,
            status: DownloadStatus,
        ) -> crate::store::Result<Vec<DownloadRecord>> {
            self.inner.list_by_status(status).await
        }

        async fn list_due_delayed(&self, now: i64) -> crate::store::Result<Vec<DownloadRecord>> {
            self.inner.list_due_delayed(now).await
        }

        async fn latest_quota(&self) -> crate::store::Result<Option<crate::store::QuotaSnapshot>> {
            self.inner.latest_quota().await
        }
    }

    #[tokio::test]
    async fn test_pipeline_marks_upload_pending_before_destination() {
        let fx = done_record(b"payload").await;
        let log = Arc::new(UploadStatusLog {
            inner: fx.store.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let config = PipelineConfig {
            upload: true,
            ..destination_only(&fx)
        };

        Pipeline::new(config, None, log.clone())
            .run(HASH, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(
            *log.seen.lock().unwrap(),
            vec![UploadStatus::Pending, UploadStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_pipeline_rerun_with_indexer_copies_once() {
        let fx = done_record(b"payload").await;
        let config = PipelineConfig {
            place_in_indexer: true,
            indexer_dir: fx.root.join("indexer"),
            ..destination_only(&fx)
        };
        let pipeline = pipeline(&fx, config);
        pipeline.run(HASH, &CancelToken::new()).await.unwrap();

        let report = pipeline.run(HASH, &CancelToken::new()).await.unwrap();

        assert_eq!(report.indexer, StepOutcome::Succeeded);
        assert_eq!(std::fs::read_dir(fx.root.join("indexer")).unwrap().count(), 1);
        assert_eq!(std::fs::read_dir(fx.root.join("library")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_cancelled_before_first_step() {
        let fx = done_record(b"payload").await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = pipeline(&fx, destination_only(&fx))
            .run(HASH, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.record.status(), DownloadStatus::Cancelled);
        assert_eq!(report.destination, StepOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_pipeline_rejects_queued_record() {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        store
            .create(HASH, &DownloadMetadata::default())
            .await
            .unwrap();
        let pipeline = Pipeline::new(PipelineConfig::default(), None, Arc::new(store));

        let err = pipeline.run(HASH, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotReady { .. }));
    }
}
