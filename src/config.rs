//! File configuration.
//!
//! The config file is TOML with one table per concern. Every key is optional;
//! missing keys take the defaults below. Resolution order for the file:
//!
//! 1. `--config <path>` (must exist)
//! 2. `$XDG_CONFIG_HOME/hashfetch/config.toml`
//! 3. `$HOME/.config/hashfetch/config.toml`
//!
//! ```toml
//! [paths]
//! temp_dir = "/var/tmp/hashfetch"
//! destination_dir = "/srv/books"
//!
//! [primary]
//! api_base = "https://primary.example.org/"
//! key = "..."            # or HASHFETCH_PRIMARY_KEY
//!
//! [fallback]
//! url_template = "https://mirror.example.org/get/{hash}"
//!
//! [pipeline]
//! upload = true
//!
//! [upload]
//! endpoint = "https://library.example.org/api/upload"
//! library_id = "main"
//! path_id = "incoming"
//! token = "..."
//!
//! [engine]
//! concurrency = 4
//! lease_timeout_secs = 120
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::download::constants::{self, MIN_PROGRESS_INTERVAL};
use crate::download::RetryPolicy;
use crate::fallback::MirrorFallbackConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::{PipelineConfig, UploadConfig};
use crate::primary::PrimaryConfig;

/// Environment variable overriding `[primary].key`.
pub const PRIMARY_KEY_ENV: &str = "HASHFETCH_PRIMARY_KEY";

const APP_DIR: &str = "hashfetch";
const CONFIG_FILE: &str = "config.toml";

/// Shortest lease; heartbeats run at a quarter of it.
const MIN_LEASE_TIMEOUT_SECS: u64 = 10;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}\n  Suggestion: Check the --config path")]
    NotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub primary: PrimarySection,
    pub fallback: FallbackSection,
    pub pipeline: PipelineSection,
    pub upload: UploadSection,
    pub engine: EngineSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub database: PathBuf,
    pub temp_dir: PathBuf,
    pub destination_dir: PathBuf,
    pub indexer_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("hashfetch.db"),
            temp_dir: PathBuf::from("hashfetch-tmp"),
            destination_dir: PathBuf::from("downloads"),
            indexer_dir: PathBuf::from("indexer"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrimarySection {
    pub api_base: Option<String>,
    pub key: Option<String>,
    pub resolve_timeout_secs: u64,
    pub path_index: Option<u32>,
    pub domain_index: Option<u32>,
    pub mirror_attempts: u32,
}

impl Default for PrimarySection {
    fn default() -> Self {
        Self {
            api_base: None,
            key: None,
            resolve_timeout_secs: constants::RESOLVE_TIMEOUT_SECS,
            path_index: None,
            domain_index: None,
            mirror_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackSection {
    pub url_template: Option<String>,
    pub max_attempts: u32,
    pub default_countdown_secs: u64,
    pub max_countdown_secs: u64,
    pub retry_delay_secs: u64,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            url_template: None,
            max_attempts: 3,
            default_countdown_secs: 60,
            max_countdown_secs: 900,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub place_in_destination: bool,
    pub upload: bool,
    pub place_in_indexer: bool,
    pub indexer_category: Option<String>,
    pub delete_temp: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            place_in_destination: true,
            upload: false,
            place_in_indexer: false,
            indexer_category: None,
            delete_temp: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub endpoint: Option<String>,
    pub library_id: String,
    pub path_id: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            library_id: String::new(),
            path_id: String::new(),
            token: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub concurrency: usize,
    pub connect_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub quota_retry_delay_secs: u64,
    /// Heartbeat age after which another process may resume a download.
    pub lease_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            concurrency: crate::orchestrator::DEFAULT_CONCURRENCY,
            connect_timeout_secs: constants::CONNECT_TIMEOUT_SECS,
            transfer_timeout_secs: constants::TRANSFER_TIMEOUT_SECS,
            progress_interval_ms: 1000,
            quota_retry_delay_secs: 3600,
            lease_timeout_secs: crate::orchestrator::DEFAULT_LEASE_TIMEOUT.as_secs(),
            max_retries: crate::download::DEFAULT_MAX_RETRIES,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Parses a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&raw, path)
    }

    fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Loads the explicit file, or the default file if it exists, or defaults.
    /// Environment overrides are applied and the result validated.
    ///
    /// Returns the config and the file it came from, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for a missing explicit file, parse
    /// errors, or validation errors.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(
                std::env::var_os("XDG_CONFIG_HOME"),
                std::env::var_os("HOME"),
            )
            .filter(|p| p.exists()),
        };

        let mut config = match &path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok((config, path))
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(PRIMARY_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.primary.key = Some(key);
        }
    }

    /// Checks value ranges and cross-section requirements.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let concurrency = self.engine.concurrency;
        if !(1..=100).contains(&concurrency) {
            return Err(ConfigError::invalid(
                "engine.concurrency",
                format!("{concurrency}. Expected range: 1..=100"),
            ));
        }

        validate_timeout_secs("engine.connect_timeout_secs", self.engine.connect_timeout_secs)?;
        validate_timeout_secs("engine.transfer_timeout_secs", self.engine.transfer_timeout_secs)?;
        validate_timeout_secs("primary.resolve_timeout_secs", self.primary.resolve_timeout_secs)?;
        validate_timeout_secs("upload.timeout_secs", self.upload.timeout_secs)?;

        let lease = self.engine.lease_timeout_secs;
        if !(MIN_LEASE_TIMEOUT_SECS..=3600).contains(&lease) {
            return Err(ConfigError::invalid(
                "engine.lease_timeout_secs",
                format!("{lease}. Expected range: {MIN_LEASE_TIMEOUT_SECS}..=3600"),
            ));
        }

        let min_interval = u64::try_from(MIN_PROGRESS_INTERVAL.as_millis()).unwrap_or(500);
        if self.engine.progress_interval_ms < min_interval {
            return Err(ConfigError::invalid(
                "engine.progress_interval_ms",
                format!(
                    "{}. Expected at least {min_interval}",
                    self.engine.progress_interval_ms
                ),
            ));
        }

        if let Some(template) = &self.fallback.url_template {
            if !template.contains(crate::fallback::HASH_PLACEHOLDER) {
                return Err(ConfigError::invalid(
                    "fallback.url_template",
                    "must contain the {hash} placeholder",
                ));
            }
        }

        if self.pipeline.upload && self.upload.endpoint.is_none() {
            return Err(ConfigError::invalid(
                "upload.endpoint",
                "required when [pipeline].upload is enabled",
            ));
        }

        Ok(())
    }

    /// Primary settings, when both the API base and a key are present.
    #[must_use]
    pub fn primary_config(&self) -> Option<PrimaryConfig> {
        let api_base = self.primary.api_base.clone()?;
        let key = self.primary.key.clone().filter(|k| !k.trim().is_empty())?;
        Some(PrimaryConfig {
            api_base,
            key,
            resolve_timeout: Duration::from_secs(self.primary.resolve_timeout_secs),
            path_index: self.primary.path_index,
            domain_index: self.primary.domain_index,
            mirror_attempts: self.primary.mirror_attempts,
        })
    }

    #[must_use]
    pub fn fallback_config(&self) -> Option<MirrorFallbackConfig> {
        let url_template = self.fallback.url_template.clone()?;
        Some(MirrorFallbackConfig {
            url_template,
            max_attempts: self.fallback.max_attempts,
            default_countdown: Duration::from_secs(self.fallback.default_countdown_secs),
            max_countdown: Duration::from_secs(self.fallback.max_countdown_secs),
            retry_delay: Duration::from_secs(self.fallback.retry_delay_secs),
            countdown_tick: Duration::from_secs(1),
        })
    }

    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            place_in_destination: self.pipeline.place_in_destination,
            destination_dir: self.paths.destination_dir.clone(),
            upload: self.pipeline.upload,
            place_in_indexer: self.pipeline.place_in_indexer,
            indexer_dir: self.paths.indexer_dir.clone(),
            indexer_category: self.pipeline.indexer_category.clone(),
            delete_temp: self.pipeline.delete_temp,
        }
    }

    #[must_use]
    pub fn upload_config(&self) -> Option<UploadConfig> {
        Some(UploadConfig {
            endpoint: self.upload.endpoint.clone()?,
            library_id: self.upload.library_id.clone(),
            path_id: self.upload.path_id.clone(),
            timeout: Duration::from_secs(self.upload.timeout_secs),
        })
    }

    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            temp_dir: self.paths.temp_dir.clone(),
            quota_retry_delay: Duration::from_secs(self.engine.quota_retry_delay_secs),
            lease_timeout: Duration::from_secs(self.engine.lease_timeout_secs),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.engine.max_retries,
            Duration::from_secs(self.engine.retry_base_delay_secs),
            Duration::from_secs(self.engine.retry_max_delay_secs),
            2.0,
        )
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.engine.progress_interval_ms)
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=3600).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{value}. Expected range: 1..=3600"),
        ))
    }
}

/// Default config path from `XDG_CONFIG_HOME`, else `HOME`.
#[must_use]
pub fn default_config_path(xdg: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = home.filter(|v| !v.is_empty())?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE),
    )
}
