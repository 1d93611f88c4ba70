//! Service wiring and command dispatch for the `hashfetch` binary.

mod progress_manager;
mod report;

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use futures_util::stream;
use hashfetch_core::store::{RecordRepository, unix_now};
use hashfetch_core::{
    Database, DownloadMetadata, DownloadStatus, EngineConfig, EngineError, HttpClient,
    LibraryUploader, MirrorFallback, Orchestrator, Pipeline, PrimaryDownloader, QuotaTracker,
    RecordStore, Scheduler, StaticCredential,
};
use tracing::{debug, info, warn};

use crate::cli::{Command, FetchArgs, RunArgs, StatusArgs};
use progress_manager::spawn_progress_ui;

/// Everything a command needs, built once from the resolved configuration.
struct Services {
    store: RecordStore,
    orchestrator: Orchestrator,
    scheduler: Scheduler,
    quota: QuotaTracker,
    concurrency: usize,
}

impl Services {
    async fn build(config: &EngineConfig) -> Result<Self> {
        let db = Database::new(&config.paths.database)
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    config.paths.database.display()
                )
            })?;
        let store = RecordStore::new(db);
        let records: Arc<dyn RecordRepository> = Arc::new(store.clone());
        let quota = QuotaTracker::new(Arc::clone(&records));

        let client = HttpClient::with_timeouts(
            std::time::Duration::from_secs(config.engine.connect_timeout_secs),
            std::time::Duration::from_secs(config.engine.transfer_timeout_secs),
        )
        .context("failed to build HTTP client")?
        .with_progress_interval(config.progress_interval());

        let uploader = config.upload_config().map(|upload| {
            let credentials = Arc::new(StaticCredential::new(config.upload.token.clone()));
            LibraryUploader::new(upload, client.inner().clone(), credentials)
        });
        let pipeline = Pipeline::new(config.pipeline_config(), uploader, Arc::clone(&records));

        let mut orchestrator =
            Orchestrator::new(store.clone(), pipeline, config.orchestrator_config());
        if let Some(primary) = config.primary_config() {
            let primary = PrimaryDownloader::new(primary, client.clone(), quota.clone())
                .context("invalid primary API configuration")?;
            orchestrator = orchestrator.with_primary(primary);
        } else {
            info!("no primary key configured, every download goes through the fallback");
        }
        if let Some(fallback) = config.fallback_config() {
            orchestrator =
                orchestrator.with_fallback(Arc::new(MirrorFallback::new(fallback, client)));
        } else {
            debug!("no fallback mirror configured");
        }

        Ok(Self {
            store,
            orchestrator,
            scheduler: Scheduler::new(records, config.retry_policy()),
            quota,
            concurrency: config.engine.concurrency,
        })
    }
}

/// Runs one subcommand against the configured services.
///
/// # Errors
///
/// Returns an error when the command could not complete, including when a
/// fetched download ends in `error`.
pub(crate) async fn run(command: Command, config: &EngineConfig, quiet: bool) -> Result<()> {
    let services = Services::build(config).await?;

    match command {
        Command::Fetch(args) => fetch(&services, args, quiet).await,
        Command::Run(args) => run_queue(&services, &args, quiet).await,
        Command::Status(args) => status(&services, &args).await,
        Command::Cancel { hash } => {
            let record = services
                .orchestrator
                .cancel(&hash)
                .await
                .with_context(|| format!("failed to cancel {hash}"))?;
            println!("{}", report::record_line(&record));
            Ok(())
        }
        Command::Reactivate { hash } => {
            let record = services
                .orchestrator
                .reactivate(&hash)
                .await
                .with_context(|| format!("failed to reactivate {hash}"))?;
            println!("{}", report::record_line(&record));
            Ok(())
        }
        Command::Pipeline { hash } => {
            let outcome = services
                .orchestrator
                .rerun_pipeline(&hash)
                .await
                .with_context(|| format!("failed to run post-download steps for {hash}"))?;
            for line in report::pipeline_lines(&outcome) {
                println!("{line}");
            }
            Ok(())
        }
        Command::Quota => {
            match services.quota.latest().await? {
                Some(snapshot) => println!("{}", report::quota_line(&snapshot)),
                None => println!("No quota observed yet."),
            }
            Ok(())
        }
    }
}

fn use_spinner(no_progress: bool, quiet: bool) -> bool {
    !no_progress && !quiet && io::stderr().is_terminal()
}

async fn fetch(services: &Services, args: FetchArgs, quiet: bool) -> Result<()> {
    let metadata = DownloadMetadata {
        title: args.title,
        author: args.author,
        format: args.format,
        declared_size: args.size,
        ..DownloadMetadata::default()
    };

    for hash in &args.hashes {
        services
            .orchestrator
            .request(hash, &metadata)
            .await
            .with_context(|| format!("failed to request {hash}"))?;
    }

    let concurrency = args.concurrency.map_or(services.concurrency, usize::from);
    let (progress_handle, stop) = spawn_progress_ui(
        use_spinner(args.no_progress, quiet),
        services.store.clone(),
        Some(args.hashes.len()),
    );

    let results: Vec<_> = stream::iter(args.hashes.iter())
        .map(|hash| async move { (hash, services.orchestrator.process(hash).await) })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let mut failed = 0_usize;
    for (hash, result) in results {
        match result {
            Ok(record) => {
                if record.status() == DownloadStatus::Error {
                    failed += 1;
                }
                println!("{}", report::record_line(&record));
            }
            Err(error @ EngineError::Busy { .. }) => {
                warn!(hash = %hash, error = %error, "skipped");
            }
            Err(error) => {
                failed += 1;
                eprintln!("{hash}: {error}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} download(s) failed", args.hashes.len());
    }
    Ok(())
}

async fn run_queue(services: &Services, args: &RunArgs, quiet: bool) -> Result<()> {
    let concurrency = args.concurrency.map_or(services.concurrency, usize::from);
    let (progress_handle, stop) = spawn_progress_ui(
        use_spinner(args.no_progress, quiet),
        services.store.clone(),
        None,
    );

    let outcome = async {
        let recovered = services.orchestrator.recover(concurrency).await?;
        let scheduled = services.scheduler.tick(unix_now()).await?;
        let processed = services.orchestrator.run_pending(concurrency).await?;
        anyhow::Ok((recovered, scheduled, processed))
    }
    .await;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let (recovered, scheduled, processed) = outcome.context("queue run failed")?;
    info!(
        resumed = recovered.total(),
        promoted_delayed = scheduled.promoted_delayed,
        requeued_failed = scheduled.requeued_failed,
        available = recovered.available + processed.available,
        failed = recovered.failed + processed.failed,
        delayed = recovered.delayed + processed.delayed,
        cancelled = recovered.cancelled + processed.cancelled,
        "run complete"
    );
    Ok(())
}

async fn status(services: &Services, args: &StatusArgs) -> Result<()> {
    if let Some(hash) = &args.hash {
        let Some(record) = services.store.get(hash).await? else {
            bail!("no download recorded for {hash}");
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            for line in report::record_details(&record) {
                println!("{line}");
            }
        }
        return Ok(());
    }

    let records = services.store.list_recent(args.limit).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No downloads recorded.");
    } else {
        for record in &records {
            println!("{}", report::record_line(record));
        }
    }
    Ok(())
}
