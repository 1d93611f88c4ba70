//! hashfetch Core Library
//!
//! Download orchestration and retry engine for artifacts addressed by content
//! hash. A requested hash is acquired from a fast, quota-limited primary
//! source or a slow fallback source, tracked durably byte by byte, and handed
//! to a configurable post-download pipeline (placement, upload, cleanup).
//!
//! # Architecture
//!
//! The library is organized into the following modules, leaves first:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Durable download records and the status graph
//! - [`quota`] - Primary quota observations
//! - [`download`] - Streaming transfers, progress, filename derivation, retry classification
//! - [`primary`] - Primary API resolution and acquisition
//! - [`fallback`] - Fallback acquisition contract and the mirror implementation
//! - [`pipeline`] - Post-download placement, library upload and cleanup
//! - [`orchestrator`] - Path selection, state transitions and batch processing
//! - [`schedule`] - Re-queueing of delayed and retryable failed records
//! - [`config`] - TOML configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod fallback;
pub mod orchestrator;
pub mod pipeline;
pub mod primary;
pub mod quota;
pub mod schedule;
pub mod store;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use db::Database;
pub use download::{
    CancelToken, DEFAULT_MAX_RETRIES, DownloadError, FailureKind, HttpClient, ProgressEvent,
    RetryDecision, RetryPolicy, classify_error,
};
pub use fallback::{FallbackDownloader, FallbackOutcome, FallbackRequest, MirrorFallback};
pub use orchestrator::{
    DEFAULT_CONCURRENCY, EngineError, Orchestrator, OrchestratorConfig, RunStats,
};
pub use pipeline::{
    CredentialProvider, LibraryUploader, Pipeline, PipelineConfig, PipelineError,
    PipelineReport, StaticCredential, UploadError,
};
pub use primary::{PrimaryConfig, PrimaryDownloader, PrimaryError};
pub use quota::QuotaTracker;
pub use schedule::{ScheduleReport, Scheduler};
pub use store::{
    DownloadMetadata, DownloadRecord, DownloadStatus, RecordStore, RecordUpdate, StoreError,
};
