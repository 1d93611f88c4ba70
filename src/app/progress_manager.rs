//! Progress UI (spinner) for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hashfetch_core::{DownloadRecord, DownloadStatus, RecordStore};
use indicatif::{ProgressBar, ProgressStyle};

use super::report::activity;

/// Spawns the progress UI (spinner) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    store: RecordStore,
    total: Option<usize>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(store, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    store: RecordStore,
    total: Option<usize>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let active = store
                .list_by_status(DownloadStatus::Downloading)
                .await
                .unwrap_or_default();
            let finished = finished_count(&store).await;
            spinner.set_message(spinner_message(&active, finished, total));
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        spinner.finish_and_clear();
    })
}

async fn finished_count(store: &RecordStore) -> usize {
    let mut finished = 0_i64;
    for status in [
        DownloadStatus::Available,
        DownloadStatus::Error,
        DownloadStatus::Delayed,
        DownloadStatus::Cancelled,
    ] {
        finished += store.count_by_status(status).await.unwrap_or(0);
    }
    usize::try_from(finished).unwrap_or(0)
}

fn spinner_message(active: &[DownloadRecord], finished: usize, total: Option<usize>) -> String {
    let position = match total {
        Some(total) => format!("[{}/{}] ", finished.min(total), total),
        None => String::new(),
    };

    let Some(current) = active.first() else {
        return format!("{position}Waiting for work...");
    };

    let label = current
        .title
        .clone()
        .unwrap_or_else(|| current.hash.chars().take(8).collect());
    let detail = activity(current).unwrap_or_else(|| "starting".to_string());
    let others = if active.len() > 1 {
        format!(" (+{} more)", active.len() - 1)
    } else {
        String::new()
    };

    format!(
        "{position}{label} {:.1}% {detail}{others}",
        current.progress
    )
}
