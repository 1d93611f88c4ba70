//! Integration tests for the acquisition engine.
//!
//! One mock server plays the primary API, the mirror and the library upload
//! endpoint; records go through the real store, orchestrator and pipeline.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hashfetch_core::fallback::MirrorFallbackConfig;
use hashfetch_core::pipeline::UploadConfig;
use hashfetch_core::store::{DownloadSource, RecordRepository, UploadStatus, unix_now};
use hashfetch_core::{
    Database, DownloadMetadata, DownloadStatus, HttpClient, LibraryUploader, MirrorFallback,
    Orchestrator, OrchestratorConfig, Pipeline, PipelineConfig, PrimaryConfig, PrimaryDownloader,
    QuotaTracker, RecordStore, RecordUpdate, StaticCredential, StoreError,
};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HASH: &str = "0123456789abcdef0123456789abcdef";
const PAYLOAD: &[u8] = b"%PDF-1.7 integration payload";
const QUOTA_DELAY: Duration = Duration::from_secs(3600);

struct Harness {
    _dir: TempDir,
    library: std::path::PathBuf,
    indexer: std::path::PathBuf,
    store: RecordStore,
    quota: QuotaTracker,
    orchestrator: Orchestrator,
}

struct Options {
    primary: bool,
    fallback: bool,
    upload: bool,
    indexer: bool,
}

async fn harness(server: &MockServer, options: Options) -> Harness {
    let dir = TempDir::new().expect("failed to create temp dir");
    let library = dir.path().join("library");
    let indexer = dir.path().join("indexer");
    let store = RecordStore::new(Database::new_in_memory().await.unwrap());
    let records: Arc<dyn RecordRepository> = Arc::new(store.clone());
    let quota = QuotaTracker::new(Arc::clone(&records));
    let client = HttpClient::new().unwrap();

    let uploader = options.upload.then(|| {
        LibraryUploader::new(
            UploadConfig {
                endpoint: format!("{}/api/library/upload", server.uri()),
                library_id: "lib-1".to_string(),
                path_id: "path-1".to_string(),
                timeout: Duration::from_secs(5),
            },
            client.inner().clone(),
            Arc::new(StaticCredential::new(Some("secret-token".to_string()))),
        )
    });

    let pipeline = Pipeline::new(
        PipelineConfig {
            place_in_destination: true,
            destination_dir: library.clone(),
            upload: options.upload,
            place_in_indexer: options.indexer,
            indexer_dir: indexer.clone(),
            delete_temp: true,
            ..PipelineConfig::default()
        },
        uploader,
        Arc::clone(&records),
    );

    let mut orchestrator = Orchestrator::new(
        store.clone(),
        pipeline,
        OrchestratorConfig {
            temp_dir: dir.path().join("tmp"),
            quota_retry_delay: QUOTA_DELAY,
            lease_timeout: Duration::from_secs(120),
        },
    );
    if options.primary {
        let primary = PrimaryDownloader::new(
            PrimaryConfig {
                api_base: server.uri(),
                key: "account-key".to_string(),
                resolve_timeout: Duration::from_secs(5),
                path_index: None,
                domain_index: None,
                mirror_attempts: 1,
            },
            client.clone(),
            quota.clone(),
        )
        .unwrap();
        orchestrator = orchestrator.with_primary(primary);
    }
    if options.fallback {
        let fallback = MirrorFallback::new(
            MirrorFallbackConfig {
                url_template: format!("{}/mirror/{{hash}}.pdf", server.uri()),
                max_attempts: 2,
                default_countdown: Duration::from_secs(1),
                max_countdown: Duration::from_secs(5),
                retry_delay: Duration::from_millis(10),
                countdown_tick: Duration::from_millis(100),
            },
            client,
        );
        orchestrator = orchestrator.with_fallback(Arc::new(fallback));
    }

    Harness {
        _dir: dir,
        library,
        indexer,
        store,
        quota,
        orchestrator,
    }
}

async fn mount_primary(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/dyn/api/fast_download.json"))
        .and(query_param("md5", HASH))
        .and(query_param("key", "account-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_mirror(server: &MockServer, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_bytes(PAYLOAD.to_vec())
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path(format!("/mirror/{HASH}.pdf")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn read(path: &str) -> Vec<u8> {
    std::fs::read(Path::new(path)).expect("final file should be readable")
}

#[tokio::test]
async fn test_primary_success_records_quota_and_places_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_primary(
        &server,
        serde_json::json!({
            "download_url": format!("{}/files/book.pdf", server.uri()),
            "account_fast_download_info": {"downloads_left": 9, "downloads_per_day": 10}
        }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/book.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD.to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Options {
            primary: true,
            fallback: false,
            upload: false,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let record = h.orchestrator.process(HASH).await.unwrap();

    assert_eq!(record.status(), DownloadStatus::Available);
    assert_eq!(record.source(), Some(DownloadSource::Primary));
    assert_eq!(record.downloads_left, Some(9));
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.delayed_retry_count, 0);
    assert!((record.progress - 100.0).abs() < f64::EPSILON);

    let final_path = record.final_path.clone().unwrap();
    assert!(Path::new(&final_path).starts_with(&h.library));
    assert_eq!(read(&final_path), PAYLOAD);

    let latest = h.quota.latest().await.unwrap().unwrap();
    assert_eq!(latest.downloads_left, 9);
    assert_eq!(latest.downloads_per_day, 10);
}

#[tokio::test]
async fn test_quota_exhaustion_falls_back_to_mirror() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_primary(
        &server,
        serde_json::json!({"download_url": null, "error": "no downloads left"}),
    )
    .await;
    mount_mirror(&server, 200).await;

    let h = harness(
        &server,
        Options {
            primary: true,
            fallback: true,
            upload: false,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let record = h.orchestrator.process(HASH).await.unwrap();

    assert_eq!(record.status(), DownloadStatus::Available);
    assert_eq!(record.source(), Some(DownloadSource::Fallback));
    assert_eq!(record.delayed_retry_count, 1);
    assert_eq!(record.retry_count, 0);
    assert!(record.next_retry_at.is_none());
    assert_eq!(read(&record.final_path.unwrap()), PAYLOAD);
}

#[tokio::test]
async fn test_quota_exhaustion_with_failing_fallback_delays_record() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_primary(
        &server,
        serde_json::json!({
            "download_url": null,
            "error": "Not allowed",
            "account_fast_download_info": {"downloads_left": 0, "downloads_per_day": 10}
        }),
    )
    .await;
    mount_mirror(&server, 404).await;

    let h = harness(
        &server,
        Options {
            primary: true,
            fallback: true,
            upload: false,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let before = unix_now();
    let record = h.orchestrator.process(HASH).await.unwrap();

    assert_eq!(record.status(), DownloadStatus::Delayed);
    assert_eq!(record.delayed_retry_count, 1);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.downloads_left, Some(0));
    let next = record.next_retry_at.unwrap();
    let delay = i64::try_from(QUOTA_DELAY.as_secs()).unwrap();
    assert!(next >= before + delay, "next_retry_at should be about one delay away");
    assert!(next <= unix_now() + delay);
}

#[tokio::test]
async fn test_upload_failure_keeps_record_available() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_mirror(&server, 200).await;
    Mock::given(method("POST"))
        .and(path("/api/library/upload"))
        .respond_with(ResponseTemplate::new(500).set_body_string("library unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Options {
            primary: false,
            fallback: true,
            upload: true,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let record = h.orchestrator.process(HASH).await.unwrap();

    assert_eq!(record.status(), DownloadStatus::Available);
    assert_eq!(record.upload_status(), Some(UploadStatus::Failed));
    assert!(record.upload_error.as_deref().unwrap().contains("500"));
    assert!(record.uploaded_at.is_none());
    assert_eq!(read(&record.final_path.unwrap()), PAYLOAD);
}

#[tokio::test]
async fn test_upload_success_marks_completed() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_mirror(&server, 200).await;
    Mock::given(method("POST"))
        .and(path("/api/library/upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Options {
            primary: false,
            fallback: true,
            upload: true,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let record = h.orchestrator.process(HASH).await.unwrap();

    assert_eq!(record.status(), DownloadStatus::Available);
    assert_eq!(record.upload_status(), Some(UploadStatus::Completed));
    assert!(record.uploaded_at.is_some());
}

#[tokio::test]
async fn test_pipeline_rerun_is_idempotent() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_mirror(&server, 200).await;

    let h = harness(
        &server,
        Options {
            primary: false,
            fallback: true,
            upload: false,
            indexer: true,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();
    let first = h.orchestrator.process(HASH).await.unwrap();
    let first_path = first.final_path.clone().unwrap();

    let report = h.orchestrator.rerun_pipeline(HASH).await.unwrap();

    assert_eq!(report.record.status(), DownloadStatus::Available);
    assert_eq!(report.record.final_path.as_deref(), Some(first_path.as_str()));
    assert_eq!(read(&first_path), PAYLOAD);
    let entries = std::fs::read_dir(&h.library).unwrap().count();
    assert_eq!(entries, 1, "rerun must not duplicate the placed file");
    let indexed = std::fs::read_dir(&h.indexer).unwrap().count();
    assert_eq!(indexed, 1, "rerun must not duplicate the indexer copy");
}

#[tokio::test]
async fn test_queued_record_cannot_jump_to_available() {
    let store = RecordStore::new(Database::new_in_memory().await.unwrap());
    store
        .create(HASH, &DownloadMetadata::default())
        .await
        .unwrap();

    let err = store
        .apply_update(HASH, RecordUpdate::status(DownloadStatus::Available))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    assert_eq!(
        store.require(HASH).await.unwrap().status(),
        DownloadStatus::Queued
    );
}

#[tokio::test]
async fn test_cancel_then_reactivate_round_trip() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let h = harness(
        &server,
        Options {
            primary: false,
            fallback: false,
            upload: false,
            indexer: false,
        },
    )
    .await;
    h.orchestrator
        .request(HASH, &DownloadMetadata::default())
        .await
        .unwrap();

    let cancelled = h.orchestrator.cancel(HASH).await.unwrap();
    assert_eq!(cancelled.status(), DownloadStatus::Cancelled);
    assert!(h.orchestrator.cancel(HASH).await.is_err());

    let requeued = h.orchestrator.reactivate(HASH).await.unwrap();
    assert_eq!(requeued.status(), DownloadStatus::Queued);
    assert_eq!(
        h.store.require(HASH).await.unwrap().status(),
        DownloadStatus::Queued
    );
}

#[tokio::test]
async fn test_run_pending_processes_every_queued_record() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let other = "fedcba9876543210fedcba9876543210";
    mount_mirror(&server, 200).await;
    Mock::given(method("GET"))
        .and(path(format!("/mirror/{other}.pdf")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Options {
            primary: false,
            fallback: true,
            upload: false,
            indexer: false,
        },
    )
    .await;
    for hash in [HASH, other] {
        h.orchestrator
            .request(hash, &DownloadMetadata::default())
            .await
            .unwrap();
    }

    let stats = h.orchestrator.run_pending(2).await.unwrap();

    assert_eq!(stats.available, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(
        h.store.require(other).await.unwrap().status(),
        DownloadStatus::Error
    );
}
