//! Plain-text rendering of records and pipeline reports.

use chrono::DateTime;
use hashfetch_core::pipeline::StepOutcome;
use hashfetch_core::store::{DownloadPhase, QuotaSnapshot};
use hashfetch_core::{DownloadRecord, DownloadStatus, PipelineReport};

/// One line per record: hash, status, progress, then the most useful detail.
pub(crate) fn record_line(record: &DownloadRecord) -> String {
    let status = record.status();
    let detail = match status {
        DownloadStatus::Available => record.final_path.clone().unwrap_or_default(),
        DownloadStatus::Error => record.error.clone().unwrap_or_default(),
        DownloadStatus::Delayed => record
            .next_retry_at
            .map(|at| format!("retry after {}", format_time(at)))
            .unwrap_or_default(),
        _ => activity(record).unwrap_or_default(),
    };
    let label = record
        .title
        .as_deref()
        .map(|title| format!(" {title}"))
        .unwrap_or_default();

    format!(
        "{}  {:<11} {:>5.1}%{label}  {detail}",
        record.hash,
        status.as_str(),
        record.progress
    )
    .trim_end()
    .to_string()
}

/// What a downloading record is doing right now: the measured rate while
/// bytes flow, otherwise its acquisition phase.
pub(crate) fn activity(record: &DownloadRecord) -> Option<String> {
    if let Some(speed) = &record.speed {
        return Some(speed.clone());
    }
    match record.phase()? {
        DownloadPhase::Bypassing => Some("bypassing protection".to_string()),
        DownloadPhase::Countdown => Some(match record.eta {
            Some(eta) => format!("waiting {eta}s"),
            None => "waiting".to_string(),
        }),
        DownloadPhase::Transferring => Some("transferring".to_string()),
    }
}

/// Multi-line view of one record for `status <hash>`.
pub(crate) fn record_details(record: &DownloadRecord) -> Vec<String> {
    let mut lines = vec![record_line(record)];
    if let Some(source) = record.source() {
        lines.push(format!("  source:        {source}"));
    }
    lines.push(format!(
        "  retries:       {} (quota delays: {})",
        record.retry_count, record.delayed_retry_count
    ));
    if let Some(path) = &record.temp_path {
        lines.push(format!("  temp path:     {path}"));
    }
    if let Some(status) = record.upload_status() {
        let error = record
            .upload_error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default();
        lines.push(format!("  upload:        {status}{error}"));
    }
    if let Some(quota) = record.quota() {
        lines.push(format!("  quota:         {}", quota_line(&quota)));
    }
    lines
}

pub(crate) fn pipeline_lines(report: &PipelineReport) -> Vec<String> {
    let mut lines = vec![record_line(&report.record)];
    for (name, outcome) in [
        ("destination", &report.destination),
        ("upload", &report.upload),
        ("indexer", &report.indexer),
        ("temp cleanup", &report.temp_cleanup),
    ] {
        lines.push(format!("  {name:<13} {}", step_text(outcome)));
    }
    if report.cancelled {
        lines.push("  (cancelled before all steps ran)".to_string());
    }
    lines
}

pub(crate) fn quota_line(quota: &QuotaSnapshot) -> String {
    format!(
        "{}/{} downloads left (checked {})",
        quota.downloads_left,
        quota.downloads_per_day,
        format_time(quota.checked_at)
    )
}

fn step_text(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Skipped => "skipped".to_string(),
        StepOutcome::Succeeded => "ok".to_string(),
        StepOutcome::Failed(message) => format!("failed: {message}"),
    }
}

fn format_time(unix: i64) -> String {
    DateTime::from_timestamp(unix, 0)
        .map_or_else(|| unix.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}
