//! Progress events and throughput sampling.
//!
//! Both acquisition paths report through the same [`ProgressEvent`] channel.
//! Byte-level progress is produced by a [`ProgressSampler`], which emits at
//! most one sample per interval and computes *instantaneous* throughput (bytes
//! since the previous sample divided by time since the previous sample), so a
//! stall shows up in `speed`/`eta` right away instead of being averaged out.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use super::constants::MIN_PROGRESS_INTERVAL;

/// Sending half of a progress channel.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Receiving half of a progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Creates an ordered progress channel.
#[must_use]
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// One progress observation from an acquisition path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The fallback is working through anti-automation protection.
    Bypassing { attempt: u32 },
    /// The fallback is waiting out a publisher-imposed countdown.
    Countdown {
        remaining_seconds: u64,
        total_seconds: u64,
        /// Unix seconds when the countdown began.
        started_at: i64,
    },
    /// Bytes are flowing.
    Downloading(TransferProgress),
}

/// Byte-level progress sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Percent complete, 0 to 100 (0 while the total is unknown).
    pub progress: f64,
    /// Human-readable instantaneous throughput.
    pub speed: String,
    /// Seconds remaining at the current speed.
    pub eta: Option<u64>,
}

/// Rate-limited sampler turning a running byte count into [`TransferProgress`].
#[derive(Debug, Clone)]
pub struct ProgressSampler {
    interval: Duration,
    total: Option<u64>,
    last_at: Instant,
    last_bytes: u64,
    last_rate: f64,
}

impl ProgressSampler {
    /// Creates a sampler whose clock starts at `now`.
    ///
    /// Intervals shorter than 500 ms are raised to 500 ms.
    #[must_use]
    pub fn new(interval: Duration, total: Option<u64>, now: Instant) -> Self {
        Self {
            interval: interval.max(MIN_PROGRESS_INTERVAL),
            total: total.filter(|t| *t > 0),
            last_at: now,
            last_bytes: 0,
            last_rate: 0.0,
        }
    }

    /// Records the running byte count; returns a sample once per interval.
    pub fn observe(&mut self, downloaded: u64, now: Instant) -> Option<TransferProgress> {
        if now.saturating_duration_since(self.last_at) < self.interval {
            return None;
        }
        Some(self.sample(downloaded, now))
    }

    /// Produces a final sample regardless of the interval.
    pub fn finish(&mut self, downloaded: u64, now: Instant) -> TransferProgress {
        self.sample(downloaded, now)
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self, downloaded: u64, now: Instant) -> TransferProgress {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = downloaded.saturating_sub(self.last_bytes);
            self.last_rate = delta as f64 / elapsed;
        }
        self.last_at = now;
        self.last_bytes = downloaded;

        let progress = self.total.map_or(0.0, |total| {
            (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        });

        TransferProgress {
            downloaded_bytes: downloaded,
            total_bytes: self.total,
            progress,
            speed: format_speed(self.last_rate),
            eta: self.eta(downloaded),
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn eta(&self, downloaded: u64) -> Option<u64> {
        let total = self.total?;
        if self.last_rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(downloaded) as f64;
        Some((remaining / self.last_rate).round() as u64)
    }
}

/// Formats a byte rate with 1024-based units and two decimals, e.g. `2.00 MB/s`.
#[must_use]
pub fn format_speed(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];

    let mut value = if bytes_per_second.is_finite() {
        bytes_per_second.max(0.0)
    } else {
        0.0
    };
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
