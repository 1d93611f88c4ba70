//! HTTP client wrapper for streaming payloads to disk.
//!
//! [`HttpClient`] is shared by the primary and fallback paths: one GET, the
//! body streamed chunk by chunk into a buffered temp file, progress sampled
//! into the caller's channel, and the cancellation flag checked at every chunk
//! boundary. Partial files are removed on any failure.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::cancel::CancelToken;
use super::constants::{CONNECT_TIMEOUT_SECS, MIN_PROGRESS_INTERVAL, TRANSFER_TIMEOUT_SECS};
use super::error::DownloadError;
use super::filename::{derive_filename, resolve_unique_path};
use super::progress::{ProgressEvent, ProgressSampler, ProgressSender};
use crate::user_agent;

/// HTTP client for streaming downloads.
///
/// Create once and clone freely; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    progress_interval: Duration,
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub url: &'a str,
    /// Content hash, used for fallback filenames.
    pub hash: &'a str,
    /// Catalog format hint used as an extension fallback.
    pub format: Option<&'a str>,
    /// Directory receiving the temp file.
    pub output_dir: &'a Path,
}

/// A completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
    /// Expected size from Content-Length, when sent.
    pub content_length: Option<u64>,
}

impl HttpClient {
    /// Creates a client with default timeouts (30 s connect, 1 h transfer).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(TRANSFER_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit connect and whole-transfer timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the client cannot be built.
    pub fn with_timeouts(connect: Duration, transfer: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect)
            .timeout(transfer)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self {
            client,
            progress_interval: MIN_PROGRESS_INTERVAL,
        })
    }

    /// Sets the progress sampling interval (never below 500 ms).
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(MIN_PROGRESS_INTERVAL);
        self
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Streams `request.url` into a new file under `request.output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The URL is invalid
    /// - The request fails (network error, timeout)
    /// - The server returns a non-2xx status
    /// - The body is empty
    /// - `cancel` is set before the last chunk is written
    /// - Writing to disk fails
    #[instrument(skip(self, progress, cancel), fields(url = %request.url, hash = %request.hash))]
    pub async fn download(
        &self,
        request: &TransferRequest<'_>,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> Result<TransferResult, DownloadError> {
        let url = request.url;
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(url));
        }

        let response = self.send_get(url).await?;

        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let filename = derive_filename(
            response.url().as_str(),
            content_disposition.as_deref(),
            request.hash,
            request.format,
        );

        tokio::fs::create_dir_all(request.output_dir)
            .await
            .map_err(|e| DownloadError::io(request.output_dir, e))?;
        let file_path = resolve_unique_path(request.output_dir, &filename);
        debug!(path = %file_path.display(), "resolved temp path");

        let mut file = File::create(&file_path)
            .await
            .map_err(|e| DownloadError::io(file_path.clone(), e))?;

        let sampler = ProgressSampler::new(self.progress_interval, content_length, Instant::now());
        let stream_result =
            stream_to_file(&mut file, response, url, &file_path, sampler, progress, cancel).await;

        let bytes_written = match stream_result {
            Ok(0) => Err(DownloadError::empty_body(url)),
            other => other,
        };
        let bytes_written = match bytes_written {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(path = %file_path.display(), "cleaning up partial file after error");
                drop(file);
                let _ = tokio::fs::remove_file(&file_path).await;
                return Err(error);
            }
        };

        info!(
            path = %file_path.display(),
            bytes = bytes_written,
            "transfer complete"
        );

        Ok(TransferResult {
            path: file_path,
            bytes_downloaded: bytes_written,
            content_length,
        })
    }

    /// Sends a GET and maps non-2xx statuses to [`DownloadError::HttpStatus`].
    pub(crate) async fn send_get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Streams the response body to `file`, returning bytes written.
///
/// Extracted so the caller can clean up on error.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    mut sampler: ProgressSampler,
    progress: &ProgressSender,
    cancel: &CancelToken,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(url));
        }

        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

        bytes_written += chunk.len() as u64;

        if let Some(sample) = sampler.observe(bytes_written, Instant::now()) {
            // A closed receiver only means nobody is watching.
            let _ = progress.send(ProgressEvent::Downloading(sample));
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

    if bytes_written > 0 {
        let _ = progress.send(ProgressEvent::Downloading(
            sampler.finish(bytes_written, Instant::now()),
        ));
    }

    Ok(bytes_written)
}
