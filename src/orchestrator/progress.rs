//! Applies progress events from an acquisition to the record.

use tracing::{debug, warn};

use crate::download::{CancelToken, ProgressEvent, ProgressReceiver};
use crate::store::{DownloadPhase, DownloadStatus, Field, RecordStore, RecordUpdate};

/// Drains `events` into the store, in order, until every sender is dropped.
///
/// A record found cancelled (for example by another process) trips `cancel`
/// so the transfer stops at its next chunk boundary.
pub(super) async fn apply_progress_events(
    store: RecordStore,
    hash: String,
    mut events: ProgressReceiver,
    cancel: CancelToken,
) {
    while let Some(event) = events.recv().await {
        match store.apply_update(&hash, progress_update(&event)).await {
            Ok(record) if record.status() == DownloadStatus::Cancelled => {
                if !cancel.is_cancelled() {
                    debug!(hash = %hash, "record cancelled externally, stopping transfer");
                    cancel.cancel();
                }
            }
            Ok(_) => {}
            Err(error) => warn!(hash = %hash, error = %error, "failed to persist progress"),
        }
    }
}

/// Maps one event onto the record. The acquisition phase goes in its own
/// column; `speed` only ever holds a measured transfer rate.
fn progress_update(event: &ProgressEvent) -> RecordUpdate {
    match event {
        ProgressEvent::Bypassing { attempt } => {
            debug!(attempt, "fallback bypass attempt");
            RecordUpdate {
                phase: Field::Set(DownloadPhase::Bypassing),
                speed: Field::Clear,
                eta: Field::Clear,
                ..RecordUpdate::default()
            }
        }
        ProgressEvent::Countdown {
            remaining_seconds,
            total_seconds,
            started_at,
        } => RecordUpdate {
            phase: Field::Set(DownloadPhase::Countdown),
            speed: Field::Clear,
            eta: Field::Set(saturating_i64(*remaining_seconds)),
            countdown_seconds: Field::Set(saturating_i64(*total_seconds)),
            countdown_started_at: Field::Set(*started_at),
            ..RecordUpdate::default()
        },
        ProgressEvent::Downloading(progress) => RecordUpdate {
            downloaded_bytes: Some(saturating_i64(progress.downloaded_bytes)),
            size: progress
                .total_bytes
                .map_or(Field::Keep, |total| Field::Set(saturating_i64(total))),
            progress: Some(progress.progress),
            phase: Field::Set(DownloadPhase::Transferring),
            speed: Field::Set(progress.speed.clone()),
            eta: progress
                .eta
                .map_or(Field::Clear, |eta| Field::Set(saturating_i64(eta))),
            countdown_seconds: Field::Clear,
            countdown_started_at: Field::Clear,
            ..RecordUpdate::default()
        },
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::download::{TransferProgress, progress_channel};
    use crate::store::DownloadMetadata;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    async fn downloading_store() -> RecordStore {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        store
            .create(HASH, &DownloadMetadata::default())
            .await
            .unwrap();
        store.claim(HASH).await.unwrap().unwrap();
        store
    }

    fn bytes(downloaded: u64, progress: f64) -> ProgressEvent {
        ProgressEvent::Downloading(TransferProgress {
            downloaded_bytes: downloaded,
            total_bytes: Some(1000),
            progress,
            speed: "1.00 KB/s".to_string(),
            eta: Some(3),
        })
    }

    #[tokio::test]
    async fn test_progress_events_are_applied_in_order() {
        let store = downloading_store().await;
        let (tx, rx) = progress_channel();
        tx.send(bytes(100, 10.0)).unwrap();
        tx.send(bytes(500, 50.0)).unwrap();
        drop(tx);

        apply_progress_events(store.clone(), HASH.to_string(), rx, CancelToken::new()).await;

        let record = store.require(HASH).await.unwrap();
        assert_eq!(record.downloaded_bytes, 500);
        assert!((record.progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(record.size, Some(1000));
        assert_eq!(record.eta, Some(3));
    }

    #[tokio::test]
    async fn test_countdown_event_persists_resume_state() {
        let store = downloading_store().await;
        let (tx, rx) = progress_channel();
        tx.send(ProgressEvent::Countdown {
            remaining_seconds: 25,
            total_seconds: 30,
            started_at: 1_700_000_000,
        })
        .unwrap();
        drop(tx);

        apply_progress_events(store.clone(), HASH.to_string(), rx, CancelToken::new()).await;

        let record = store.require(HASH).await.unwrap();
        assert_eq!(record.countdown_seconds, Some(30));
        assert_eq!(record.countdown_started_at, Some(1_700_000_000));
        assert_eq!(record.eta, Some(25));
        assert_eq!(record.phase(), Some(DownloadPhase::Countdown));
        assert!(record.speed.is_none());
    }

    #[tokio::test]
    async fn test_phase_follows_acquisition_and_speed_stays_a_rate() {
        let store = downloading_store().await;
        let (tx, rx) = progress_channel();
        tx.send(ProgressEvent::Bypassing { attempt: 2 }).unwrap();
        drop(tx);
        apply_progress_events(store.clone(), HASH.to_string(), rx, CancelToken::new()).await;

        let record = store.require(HASH).await.unwrap();
        assert_eq!(record.phase(), Some(DownloadPhase::Bypassing));
        assert!(record.speed.is_none());

        let (tx, rx) = progress_channel();
        tx.send(bytes(250, 25.0)).unwrap();
        drop(tx);
        apply_progress_events(store.clone(), HASH.to_string(), rx, CancelToken::new()).await;

        let record = store.require(HASH).await.unwrap();
        assert_eq!(record.phase(), Some(DownloadPhase::Transferring));
        assert_eq!(record.speed.as_deref(), Some("1.00 KB/s"));
    }

    #[tokio::test]
    async fn test_cancelled_record_trips_token() {
        let store = downloading_store().await;
        store
            .apply_update(HASH, RecordUpdate::status(DownloadStatus::Cancelled))
            .await
            .unwrap();
        let (tx, rx) = progress_channel();
        tx.send(bytes(100, 10.0)).unwrap();
        drop(tx);
        let cancel = CancelToken::new();

        apply_progress_events(store.clone(), HASH.to_string(), rx, cancel.clone()).await;

        assert!(cancel.is_cancelled());
        let record = store.require(HASH).await.unwrap();
        assert_eq!(record.downloaded_bytes, 0, "late progress never lands");
    }
}
