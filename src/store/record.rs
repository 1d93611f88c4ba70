//! Download record types, status definitions, and the canonical update merge.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::error::StoreError;

/// Lifecycle status of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a worker.
    Queued,
    /// Bytes are being acquired (including fallback countdowns).
    Downloading,
    /// Payload written and validated; post-download steps pending.
    Done,
    /// Post-download steps finished; `final_path` is set.
    Available,
    /// Acquisition or placement failed.
    Error,
    /// Stopped by explicit user action.
    Cancelled,
    /// Parked until `next_retry_at` because the primary quota ran out.
    Delayed,
}

impl DownloadStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Queued,
        Self::Downloading,
        Self::Done,
        Self::Available,
        Self::Error,
        Self::Cancelled,
        Self::Delayed,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Available => "available",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Delayed => "delayed",
        }
    }

    /// Returns true for statuses that only an explicit action can leave.
    ///
    /// `Error` is not listed: whether a failed record is finished depends on
    /// the retry budget, which is a scheduling decision.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Available | Self::Cancelled)
    }

    /// Returns true when a worker or the scheduler still owns this record.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Downloading | Self::Done | Self::Delayed
        )
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Writing the current status again is always allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Queued => matches!(next, Self::Downloading | Self::Delayed | Self::Cancelled),
            Self::Downloading => matches!(
                next,
                Self::Done | Self::Error | Self::Delayed | Self::Cancelled
            ),
            Self::Delayed => matches!(next, Self::Queued | Self::Cancelled),
            Self::Done => matches!(next, Self::Available | Self::Error | Self::Cancelled),
            Self::Error | Self::Cancelled => matches!(next, Self::Queued),
            Self::Available => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "done" => Ok(Self::Done),
            "available" => Ok(Self::Available),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            "delayed" => Ok(Self::Delayed),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Outcome of the library upload step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid upload status: {s}")),
        }
    }
}

/// Persisted classification of the last failure, read by the retry scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or timeout failure; retryable within the budget.
    Transient,
    /// The source answered but the artifact cannot be fetched as-is.
    Permanent,
    /// Local disk failure.
    Filesystem,
    /// No usable acquisition path is configured.
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Filesystem => "filesystem",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "filesystem" => Ok(Self::Filesystem),
            "configuration" => Ok(Self::Configuration),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

/// Which acquisition path produced the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
    Primary,
    Fallback,
}

impl DownloadSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a `downloading` record is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    /// The fallback is getting past the mirror's protection.
    Bypassing,
    /// The fallback is waiting out a throttling countdown.
    Countdown,
    /// Bytes are flowing.
    Transferring,
}

impl DownloadPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bypassing => "bypassing",
            Self::Countdown => "countdown",
            Self::Transferring => "transferring",
        }
    }
}

impl fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bypassing" => Ok(Self::Bypassing),
            "countdown" => Ok(Self::Countdown),
            "transferring" => Ok(Self::Transferring),
            _ => Err(format!("invalid download phase: {s}")),
        }
    }
}

/// Descriptive metadata supplied when a download is requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub title: Option<String>,
    pub filename: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    /// File format / extension hint such as `pdf` or `epub`.
    pub format: Option<String>,
    /// Size advertised by the catalog, in bytes.
    pub declared_size: Option<i64>,
}

/// Primary-source allowance observed on one resolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub downloads_left: i64,
    pub downloads_per_day: i64,
    /// Unix seconds.
    pub checked_at: i64,
}

impl QuotaSnapshot {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.downloads_left <= 0
    }
}

/// One row of the `downloads` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct DownloadRecord {
    pub hash: String,

    pub title: Option<String>,
    pub filename: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub format: Option<String>,
    pub declared_size: Option<i64>,

    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    pub downloaded_bytes: i64,
    /// Total bytes when known from the transfer.
    pub size: Option<i64>,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    /// Human-readable throughput such as `2.00 MB/s`. Only set while bytes flow.
    pub speed: Option<String>,
    /// Seconds remaining at the last sample.
    pub eta: Option<i64>,
    #[sqlx(rename = "phase")]
    pub phase_str: Option<String>,

    pub retry_count: i64,
    pub delayed_retry_count: i64,
    pub next_retry_at: Option<i64>,

    pub countdown_seconds: Option<i64>,
    pub countdown_started_at: Option<i64>,

    pub downloads_left: Option<i64>,
    pub downloads_per_day: Option<i64>,
    pub quota_checked_at: Option<i64>,

    pub temp_path: Option<String>,
    pub final_path: Option<String>,

    pub error: Option<String>,
    #[sqlx(rename = "error_kind")]
    pub error_kind_str: Option<String>,
    #[sqlx(rename = "source")]
    pub source_str: Option<String>,

    #[sqlx(rename = "upload_status")]
    pub upload_status_str: Option<String>,
    pub uploaded_at: Option<i64>,
    pub upload_error: Option<String>,

    pub updated_at: i64,
    /// Bumped on every write; writers compare it to detect concurrent changes.
    pub revision: i64,
    /// Store instance holding the `downloading` lease.
    pub worker_id: Option<String>,
    /// Last sign of life from `worker_id`.
    pub heartbeat_at: Option<i64>,
}

impl DownloadRecord {
    /// The default record every new hash starts from.
    #[must_use]
    pub fn new(hash: &str, metadata: &DownloadMetadata, now: i64) -> Self {
        Self {
            hash: hash.to_string(),
            title: metadata.title.clone(),
            filename: metadata.filename.clone(),
            author: metadata.author.clone(),
            publisher: metadata.publisher.clone(),
            language: metadata.language.clone(),
            format: metadata.format.clone(),
            declared_size: metadata.declared_size,
            status_str: DownloadStatus::Queued.as_str().to_string(),
            queued_at: now,
            started_at: None,
            completed_at: None,
            downloaded_bytes: 0,
            size: None,
            progress: 0.0,
            speed: None,
            eta: None,
            phase_str: None,
            retry_count: 0,
            delayed_retry_count: 0,
            next_retry_at: None,
            countdown_seconds: None,
            countdown_started_at: None,
            downloads_left: None,
            downloads_per_day: None,
            quota_checked_at: None,
            temp_path: None,
            final_path: None,
            error: None,
            error_kind_str: None,
            source_str: None,
            upload_status_str: None,
            uploaded_at: None,
            upload_error: None,
            updated_at: now,
            revision: 0,
            worker_id: None,
            heartbeat_at: None,
        }
    }

    /// Returns the parsed status enum.
    ///
    /// Falls back to `Error` if the stored string is invalid so a corrupt row
    /// is never picked up by a worker.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Error)
    }

    #[must_use]
    pub fn upload_status(&self) -> Option<UploadStatus> {
        self.upload_status_str.as_deref().and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn phase(&self) -> Option<DownloadPhase> {
        self.phase_str.as_deref().and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind_str.as_deref().and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn source(&self) -> Option<DownloadSource> {
        match self.source_str.as_deref() {
            Some("primary") => Some(DownloadSource::Primary),
            Some("fallback") => Some(DownloadSource::Fallback),
            _ => None,
        }
    }

    /// Quota observed on the last primary resolution, when one was recorded.
    #[must_use]
    pub fn quota(&self) -> Option<QuotaSnapshot> {
        Some(QuotaSnapshot {
            downloads_left: self.downloads_left?,
            downloads_per_day: self.downloads_per_day?,
            checked_at: self.quota_checked_at?,
        })
    }

    /// Descriptive metadata as supplied at request time.
    #[must_use]
    pub fn metadata(&self) -> DownloadMetadata {
        DownloadMetadata {
            title: self.title.clone(),
            filename: self.filename.clone(),
            author: self.author.clone(),
            publisher: self.publisher.clone(),
            language: self.language.clone(),
            format: self.format.clone(),
            declared_size: self.declared_size,
        }
    }
}

impl fmt::Display for DownloadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadRecord {{ hash: {}, status: {}, progress: {:.1} }}",
            self.hash,
            self.status(),
            self.progress
        )
    }
}

/// Change to a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Field<T> {
    /// Leave the stored value untouched.
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Field<T> {
    fn merge_into(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(value),
            Self::Clear => *slot = None,
        }
    }

    fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// A partial update to a download record.
///
/// Every write to an existing record goes through [`RecordUpdate::apply_to`],
/// which enforces the status graph and the progress rules in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<DownloadStatus>,

    pub downloaded_bytes: Option<i64>,
    pub size: Field<i64>,
    pub progress: Option<f64>,
    pub speed: Field<String>,
    pub eta: Field<i64>,
    pub phase: Field<DownloadPhase>,

    pub increment_retry: bool,
    pub increment_delayed_retry: bool,
    pub next_retry_at: Field<i64>,

    pub countdown_seconds: Field<i64>,
    pub countdown_started_at: Field<i64>,

    pub quota: Option<QuotaSnapshot>,

    pub temp_path: Field<String>,
    pub final_path: Field<String>,

    pub error: Field<String>,
    pub error_kind: Field<ErrorKind>,
    pub source: Field<DownloadSource>,

    pub upload_status: Field<UploadStatus>,
    pub uploaded_at: Field<i64>,
    pub upload_error: Field<String>,
}

impl RecordUpdate {
    /// Update that only moves the status.
    #[must_use]
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn touches_progress(&self) -> bool {
        self.downloaded_bytes.is_some()
            || self.progress.is_some()
            || !self.speed.is_keep()
            || !self.eta.is_keep()
            || !self.size.is_keep()
            || !self.phase.is_keep()
    }

    /// Merges this update into `record`.
    ///
    /// Rules, in order:
    /// - status changes must follow [`DownloadStatus::can_transition_to`];
    /// - progress-only writes are dropped unless the record is downloading, so
    ///   a terminal status is never overwritten by a late progress sample;
    /// - progress is clamped to `[0, 100]` and never decreases while the record
    ///   stays in `downloading`;
    /// - `next_retry_at` is kept only while the status is `delayed`;
    /// - `started_at` and `completed_at` are stamped once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] for a disallowed status change
    /// and [`StoreError::MissingRetryTime`] when entering `delayed` without a
    /// retry time.
    pub fn apply_to(self, record: &mut DownloadRecord, now: i64) -> Result<(), StoreError> {
        let current = record.status();
        let next = self.status.unwrap_or(current);

        if !current.can_transition_to(next) {
            return Err(StoreError::invalid_transition(&record.hash, current, next));
        }

        let progress_allowed = self.status.is_some() || current == DownloadStatus::Downloading;
        if progress_allowed && self.touches_progress() {
            if let Some(bytes) = self.downloaded_bytes {
                record.downloaded_bytes = bytes.max(0);
            }
            if let Some(progress) = self.progress.filter(|p| !p.is_nan()) {
                let clamped = progress.clamp(0.0, 100.0);
                record.progress = if current == DownloadStatus::Downloading
                    && next == DownloadStatus::Downloading
                {
                    clamped.max(record.progress)
                } else {
                    clamped
                };
            }
            self.size.merge_into(&mut record.size);
            self.speed.merge_into(&mut record.speed);
            self.eta.merge_into(&mut record.eta);
            self.phase
                .map_into(&mut record.phase_str, |p| p.as_str().to_string());
        }
        if next != DownloadStatus::Downloading {
            record.phase_str = None;
        }

        if self.increment_retry {
            record.retry_count += 1;
        }
        if self.increment_delayed_retry {
            record.delayed_retry_count += 1;
        }

        self.next_retry_at.merge_into(&mut record.next_retry_at);
        if next == DownloadStatus::Delayed {
            if record.next_retry_at.is_none() {
                return Err(StoreError::MissingRetryTime(record.hash.clone()));
            }
        } else {
            record.next_retry_at = None;
        }

        self.countdown_seconds
            .merge_into(&mut record.countdown_seconds);
        self.countdown_started_at
            .merge_into(&mut record.countdown_started_at);

        if let Some(quota) = self.quota {
            record.downloads_left = Some(quota.downloads_left);
            record.downloads_per_day = Some(quota.downloads_per_day);
            record.quota_checked_at = Some(quota.checked_at);
        }

        self.temp_path.merge_into(&mut record.temp_path);
        self.final_path.merge_into(&mut record.final_path);
        self.error.merge_into(&mut record.error);
        self.error_kind
            .map_into(&mut record.error_kind_str, |k| k.as_str().to_string());
        self.source
            .map_into(&mut record.source_str, |s| s.as_str().to_string());
        self.upload_status
            .map_into(&mut record.upload_status_str, |s| s.as_str().to_string());
        self.uploaded_at.merge_into(&mut record.uploaded_at);
        self.upload_error.merge_into(&mut record.upload_error);

        if next == DownloadStatus::Downloading && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if next == DownloadStatus::Done && record.completed_at.is_none() {
            record.completed_at = Some(now);
        }

        record.status_str = next.as_str().to_string();
        record.updated_at = now;
        Ok(())
    }
}

impl<T> Field<T> {
    fn map_into(self, slot: &mut Option<String>, f: impl FnOnce(T) -> String) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(f(value)),
            Self::Clear => *slot = None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record_in(status: DownloadStatus) -> DownloadRecord {
        let mut record = DownloadRecord::new("abc", &DownloadMetadata::default(), 100);
        record.status_str = status.as_str().to_string();
        if status == DownloadStatus::Delayed {
            record.next_retry_at = Some(500);
        }
        record
    }

    #[test]
    fn test_download_status_round_trips_through_str() {
        for status in DownloadStatus::ALL {
            let parsed: DownloadStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_download_status_queued_cannot_skip_to_available() {
        assert!(!DownloadStatus::Queued.can_transition_to(DownloadStatus::Available));
        assert!(!DownloadStatus::Queued.can_transition_to(DownloadStatus::Done));
        assert!(!DownloadStatus::Downloading.can_transition_to(DownloadStatus::Available));
    }

    #[test]
    fn test_download_status_available_is_final() {
        for next in DownloadStatus::ALL {
            let allowed = DownloadStatus::Available.can_transition_to(next);
            assert_eq!(allowed, next == DownloadStatus::Available, "available -> {next}");
        }
    }

    #[test]
    fn test_download_status_cancelled_only_reactivates() {
        assert!(DownloadStatus::Cancelled.can_transition_to(DownloadStatus::Queued));
        assert!(!DownloadStatus::Cancelled.can_transition_to(DownloadStatus::Downloading));
    }

    #[test]
    fn test_apply_to_rejects_invalid_transition() {
        let mut record = record_in(DownloadStatus::Queued);
        let result = RecordUpdate::status(DownloadStatus::Available).apply_to(&mut record, 200);
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
        assert_eq!(record.status(), DownloadStatus::Queued);
    }

    #[test]
    fn test_apply_to_progress_is_monotonic_while_downloading() {
        let mut record = record_in(DownloadStatus::Downloading);
        RecordUpdate {
            progress: Some(40.0),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 200)
        .unwrap();
        RecordUpdate {
            progress: Some(25.0),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 201)
        .unwrap();

        assert!((record.progress - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_to_clamps_progress() {
        let mut record = record_in(DownloadStatus::Downloading);
        RecordUpdate {
            progress: Some(180.0),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 200)
        .unwrap();
        assert!((record.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_to_drops_late_progress_after_terminal_status() {
        let mut record = record_in(DownloadStatus::Cancelled);
        record.progress = 30.0;
        RecordUpdate {
            progress: Some(90.0),
            downloaded_bytes: Some(9000),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 200)
        .unwrap();

        assert!((record.progress - 30.0).abs() < f64::EPSILON);
        assert_eq!(record.downloaded_bytes, 0);
        assert_eq!(record.status(), DownloadStatus::Cancelled);
    }

    #[test]
    fn test_apply_to_delayed_requires_retry_time() {
        let mut record = record_in(DownloadStatus::Downloading);
        let result = RecordUpdate::status(DownloadStatus::Delayed).apply_to(&mut record, 200);
        assert!(matches!(result, Err(StoreError::MissingRetryTime(_))));
    }

    #[test]
    fn test_apply_to_leaving_delayed_clears_retry_time() {
        let mut record = record_in(DownloadStatus::Delayed);
        RecordUpdate::status(DownloadStatus::Queued)
            .apply_to(&mut record, 600)
            .unwrap();
        assert_eq!(record.next_retry_at, None);
    }

    #[test]
    fn test_apply_to_ignores_retry_time_outside_delayed() {
        let mut record = record_in(DownloadStatus::Downloading);
        RecordUpdate {
            next_retry_at: Field::Set(900),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 200)
        .unwrap();
        assert_eq!(record.next_retry_at, None);
    }

    #[test]
    fn test_apply_to_stamps_timestamps_once() {
        let mut record = record_in(DownloadStatus::Queued);
        RecordUpdate::status(DownloadStatus::Downloading)
            .apply_to(&mut record, 200)
            .unwrap();
        RecordUpdate::status(DownloadStatus::Done)
            .apply_to(&mut record, 300)
            .unwrap();
        RecordUpdate::status(DownloadStatus::Done)
            .apply_to(&mut record, 400)
            .unwrap();

        assert_eq!(record.started_at, Some(200));
        assert_eq!(record.completed_at, Some(300));
        assert_eq!(record.updated_at, 400);
    }

    #[test]
    fn test_apply_to_increments_counters_independently() {
        let mut record = record_in(DownloadStatus::Downloading);
        RecordUpdate {
            status: Some(DownloadStatus::Delayed),
            increment_delayed_retry: true,
            next_retry_at: Field::Set(1000),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 200)
        .unwrap();

        assert_eq!(record.delayed_retry_count, 1);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.next_retry_at, Some(1000));
    }

    #[test]
    fn test_record_quota_requires_all_fields() {
        let mut record = record_in(DownloadStatus::Queued);
        assert_eq!(record.quota(), None);
        RecordUpdate {
            quota: Some(QuotaSnapshot {
                downloads_left: 3,
                downloads_per_day: 25,
                checked_at: 150,
            }),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 150)
        .unwrap();
        assert_eq!(record.quota().unwrap().downloads_left, 3);
    }

    #[test]
    fn test_record_unknown_status_reads_as_error() {
        let mut record = record_in(DownloadStatus::Queued);
        record.status_str = "bogus".to_string();
        assert_eq!(record.status(), DownloadStatus::Error);
    }

    #[test]
    fn test_phase_is_kept_separate_from_speed_and_cleared_on_exit() {
        let mut record = record_in(DownloadStatus::Downloading);
        RecordUpdate {
            phase: Field::Set(DownloadPhase::Countdown),
            eta: Field::Set(25),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 150)
        .unwrap();
        assert_eq!(record.phase(), Some(DownloadPhase::Countdown));
        assert!(record.speed.is_none());

        RecordUpdate::status(DownloadStatus::Cancelled)
            .apply_to(&mut record, 160)
            .unwrap();
        assert!(record.phase().is_none());
    }

    #[test]
    fn test_phase_ignored_once_record_left_downloading() {
        let mut record = record_in(DownloadStatus::Cancelled);
        RecordUpdate {
            phase: Field::Set(DownloadPhase::Transferring),
            ..RecordUpdate::default()
        }
        .apply_to(&mut record, 150)
        .unwrap();
        assert!(record.phase_str.is_none());
    }
}
