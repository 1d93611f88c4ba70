//! Streaming transfer building blocks shared by every acquisition path.
//!
//! # Features
//!
//! - Streaming downloads into a temp directory (memory-efficient for large files)
//! - Ordered filename derivation (multi-field URL segment, Content-Disposition,
//!   URL extension, hash)
//! - Rate-limited progress sampling with instantaneous speed and ETA
//! - Cooperative cancellation checked at chunk boundaries
//! - Failure classification and exponential retry backoff
//!
//! # Example
//!
//! ```no_run
//! use hashfetch_core::download::{CancelToken, HttpClient, TransferRequest, progress_channel};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let (tx, _rx) = progress_channel();
//! let request = TransferRequest {
//!     url: "https://example.com/file.pdf",
//!     hash: "0123456789abcdef0123456789abcdef",
//!     format: Some("pdf"),
//!     output_dir: Path::new("./tmp"),
//! };
//! let result = client.download(&request, &tx, &CancelToken::new()).await?;
//! println!("Downloaded: {}", result.path.display());
//! # Ok(())
//! # }
//! ```

mod cancel;
mod client;
pub mod constants;
mod error;
mod filename;
mod progress;
mod retry;

pub use cancel::CancelToken;
pub use client::{HttpClient, TransferRequest, TransferResult};
pub use error::DownloadError;
pub use filename::derive_filename;
pub(crate) use filename::sanitize_filename;
pub use progress::{
    ProgressEvent, ProgressReceiver, ProgressSampler, ProgressSender, TransferProgress,
    format_speed, progress_channel,
};
pub(crate) use retry::is_tls_error;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureKind, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
