//! Library upload step.
//!
//! The library accepts a bearer-authenticated multipart POST carrying the
//! file plus the target `library_id` / `path_id`. Credentials come from a
//! [`CredentialProvider`]; how tokens are minted is out of scope here, the
//! uploader only asks for the current one and refreshes it when it is about to
//! expire.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::download::is_tls_error;
use crate::store::unix_now;

/// Tokens expiring within this many seconds are refreshed before use.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Errors from the upload step. None of them affect the download status.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(
        "no valid library credential: {message}\n  Suggestion: Set [upload].token in the config file or sign in to the library again"
    )]
    Credential { message: String },

    #[error("library at {url} refused the connection")]
    ConnectionRefused { url: String },

    #[error("cannot resolve library host for {url}\n  Suggestion: Check [upload].endpoint")]
    UnresolvedHost { url: String },

    #[error("TLS handshake with {url} failed: {message}")]
    Tls { url: String, message: String },

    #[error("upload to {url} timed out")]
    Timeout { url: String },

    #[error("upload to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("library rejected upload with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UploadError {
    fn from_send(url: &str, error: &reqwest::Error) -> Self {
        let url = url.to_string();
        if error.is_timeout() {
            return Self::Timeout { url };
        }
        if is_tls_error(error) {
            return Self::Tls {
                url,
                message: error.to_string(),
            };
        }
        match connect_failure(error) {
            Some(ConnectFailure::Refused) => Self::ConnectionRefused { url },
            Some(ConnectFailure::Unresolved) => Self::UnresolvedHost { url },
            None => Self::Network {
                url,
                message: error.to_string(),
            },
        }
    }
}

enum ConnectFailure {
    Refused,
    Unresolved,
}

fn connect_failure(error: &reqwest::Error) -> Option<ConnectFailure> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if err
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::ConnectionRefused)
        {
            return Some(ConnectFailure::Refused);
        }
        let text = err.to_string().to_lowercase();
        if text.contains("connection refused") {
            return Some(ConnectFailure::Refused);
        }
        if text.contains("dns")
            || text.contains("failed to lookup")
            || text.contains("name or service not known")
            || text.contains("no such host")
        {
            return Some(ConnectFailure::Unresolved);
        }
        current = err.source();
    }
    error.is_connect().then_some(ConnectFailure::Refused)
}

/// A bearer token and its expiry (unix seconds, `None` = does not expire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<i64>,
}

impl AccessToken {
    /// True when the token is usable for at least the refresh buffer.
    #[must_use]
    pub fn is_fresh_at(&self, now: i64) -> bool {
        !self.token.is_empty()
            && self
                .expires_at
                .is_none_or(|at| at - TOKEN_REFRESH_BUFFER_SECS > now)
    }
}

/// Source of library access tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The token currently held, if any.
    async fn current(&self) -> Option<AccessToken>;

    /// Obtains a new token.
    async fn refresh(&self) -> Result<AccessToken, UploadError>;
}

/// Long-lived token read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential {
    token: Option<String>,
}

impl StaticCredential {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn current(&self) -> Option<AccessToken> {
        self.token.clone().map(|token| AccessToken {
            token,
            expires_at: None,
        })
    }

    async fn refresh(&self) -> Result<AccessToken, UploadError> {
        self.current().await.ok_or_else(|| UploadError::Credential {
            message: "no library token configured".to_string(),
        })
    }
}

/// Where uploads go.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub endpoint: String,
    pub library_id: String,
    pub path_id: String,
    pub timeout: Duration,
}

/// Uploads finished artifacts to the library.
#[derive(Clone)]
pub struct LibraryUploader {
    config: UploadConfig,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    cached: Arc<Mutex<Option<AccessToken>>>,
}

impl std::fmt::Debug for LibraryUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryUploader")
            .field("endpoint", &self.config.endpoint)
            .field("library_id", &self.config.library_id)
            .finish_non_exhaustive()
    }
}

impl LibraryUploader {
    #[must_use]
    pub fn new(
        config: UploadConfig,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            client,
            credentials,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a token valid for at least the refresh buffer.
    async fn ensure_token(&self) -> Result<String, UploadError> {
        let now = unix_now();
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh_at(now)) {
            return Ok(token.token.clone());
        }

        let token = match self.credentials.current().await {
            Some(token) if token.is_fresh_at(now) => token,
            _ => {
                debug!("library token missing or expiring, refreshing");
                let refreshed = self.credentials.refresh().await?;
                if !refreshed.is_fresh_at(now) {
                    return Err(UploadError::Credential {
                        message: "refreshed token is already expired".to_string(),
                    });
                }
                refreshed
            }
        };

        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Uploads `path` to the configured library.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError`] for credential, connection, HTTP or read
    /// failures.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn upload(&self, path: &Path) -> Result<(), UploadError> {
        let token = self.ensure_token().await?;

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| UploadError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| UploadError::Io {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        let file_name = path
            .file_name()
            .map_or_else(|| "upload.bin".to_string(), |n| n.to_string_lossy().into_owned());

        // Streamed from disk; the length lets the form carry a Content-Length.
        let form = Form::new()
            .part(
                "file",
                Part::stream_with_length(reqwest::Body::from(file), size).file_name(file_name),
            )
            .text("library_id", self.config.library_id.clone())
            .text("path_id", self.config.path_id.clone());

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(token)
            .timeout(self.config.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::from_send(&self.config.endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        info!(bytes = size, "uploaded to library");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    struct ExpiringCredential {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for ExpiringCredential {
        async fn current(&self) -> Option<AccessToken> {
            Some(AccessToken {
                token: "stale".to_string(),
                expires_at: Some(unix_now() + 10),
            })
        }

        async fn refresh(&self) -> Result<AccessToken, UploadError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: "fresh".to_string(),
                expires_at: Some(unix_now() + 3600),
            })
        }
    }

    fn config(endpoint: String) -> UploadConfig {
        UploadConfig {
            endpoint,
            library_id: "lib-1".to_string(),
            path_id: "path-1".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn artifact(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        path
    }

    #[test]
    fn test_access_token_freshness_uses_buffer() {
        let now = 1_000;
        let token = |expires_at| AccessToken {
            token: "t".to_string(),
            expires_at,
        };
        assert!(token(None).is_fresh_at(now));
        assert!(token(Some(now + 61)).is_fresh_at(now));
        assert!(!token(Some(now + 60)).is_fresh_at(now));
        assert!(!token(Some(now - 5)).is_fresh_at(now));
    }

    #[tokio::test]
    async fn test_upload_posts_multipart_with_bearer() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config(format!("{}/upload", server.uri())),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(Some("secret".to_string()))),
        );

        uploader.upload(&artifact(&dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_streams_file_contents_from_disk() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config(format!("{}/upload", server.uri())),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(Some("secret".to_string()))),
        );
        uploader.upload(&artifact(&dir)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body).into_owned();
        assert!(body.contains("filename=\"book.pdf\""), "{body}");
        assert!(body.contains("%PDF-1.7"));
        assert!(body.contains("lib-1"));
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config("http://127.0.0.1:9/upload".to_string()),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(Some("secret".to_string()))),
        );

        let err = uploader
            .upload(&dir.path().join("gone.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_upload_http_error_carries_status() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config(format!("{}/upload", server.uri())),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(Some("secret".to_string()))),
        );

        let err = uploader.upload(&artifact(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Http { status: 500, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_upload_refreshes_expiring_token() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let credentials = Arc::new(ExpiringCredential {
            refreshes: AtomicU32::new(0),
        });
        let uploader = LibraryUploader::new(
            config(format!("{}/upload", server.uri())),
            reqwest::Client::new(),
            credentials.clone(),
        );

        let file = artifact(&dir);
        uploader.upload(&file).await.unwrap();
        uploader.upload(&file).await.unwrap();
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1, "cached after refresh");
    }

    #[tokio::test]
    async fn test_upload_without_token_is_credential_error() {
        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config("http://127.0.0.1:9/upload".to_string()),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(None)),
        );

        let err = uploader.upload(&artifact(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Credential { .. }));
        assert!(err.to_string().contains("Suggestion:"));
    }

    #[tokio::test]
    async fn test_upload_connection_refused_is_classified() {
        let Ok(listener) = std::net::TcpListener::bind("127.0.0.1:0") else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = TempDir::new().unwrap();
        let uploader = LibraryUploader::new(
            config(format!("http://127.0.0.1:{port}/upload")),
            reqwest::Client::new(),
            Arc::new(StaticCredential::new(Some("secret".to_string()))),
        );

        let err = uploader.upload(&artifact(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::ConnectionRefused { .. }), "{err:?}");
    }
}
