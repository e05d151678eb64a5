//! Service configuration and config file resolution
//!
//! Resolution priority (highest first):
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Built-in default
//!
//! Steps 1 and 2 are applied by the binary (clap `env` attributes) on top of
//! the [`ServiceConfig`] loaded here.

use crate::api::{AudioFormat, Decoder};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "TRANSCRIBE_CONFIG";

/// Language codes accepted by the default multilingual model
pub const DEFAULT_LANGUAGES: &[&str] = &[
    "as", "bn", "brx", "doi", "gu", "hi", "kn", "kok", "ks", "mai", "ml", "mni", "mr", "ne", "or",
    "pa", "sa", "sat", "sd", "ta", "te", "ur",
];

/// Longest accepted request budget (one day)
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 86_400;

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub ingest: IngestConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

/// Admission control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of requests admitted for transcription at once
    pub concurrency_limit: usize,
    /// End-to-end budget for one request, from arrival to response (seconds).
    /// Defaults to the 75 s keep-alive of the deployment.
    pub request_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            request_timeout_secs: 75,
        }
    }
}

/// Upload ingestion limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Uploads larger than this are spooled to a temporary file
    pub memory_threshold_bytes: u64,
    /// Accepted audio formats
    pub allowed_formats: Vec<AudioFormat>,
    /// Directory for spooled uploads (system temp dir when unset)
    pub spool_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 25 * 1024 * 1024,
            memory_threshold_bytes: 4 * 1024 * 1024,
            allowed_formats: AudioFormat::all().to_vec(),
            spool_dir: None,
        }
    }
}

/// Which engine implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Forward prepared audio to an upstream inference server
    Remote,
    /// Decode locally and return a canned transcript after a fixed delay
    Stub,
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(EngineKind::Remote),
            "stub" => Ok(EngineKind::Stub),
            other => Err(Error::InvalidInput(format!("unknown engine kind '{}'", other))),
        }
    }
}

/// Transcription engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Upstream inference endpoint (remote engine only)
    pub url: Option<String>,
    /// Concurrent calls the engine tolerates (1 = fully serialized)
    pub parallelism: usize,
    /// Longest accepted audio after decoding (seconds)
    pub max_duration_secs: u64,
    /// Apply loudness normalization before inference
    pub normalize: bool,
    pub default_language: String,
    pub languages: Vec<String>,
    pub default_decoder: Decoder,
    /// Simulated inference time (stub engine only)
    pub stub_latency_ms: u64,
    /// Transcript returned by the stub engine
    pub stub_text: String,
    /// Pause between warm-up attempts while the engine is not ready (seconds)
    pub warmup_retry_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Stub,
            url: None,
            parallelism: 1,
            max_duration_secs: 600,
            normalize: false,
            default_language: "hi".to_string(),
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            default_decoder: Decoder::Rnnt,
            stub_latency_ms: 250,
            stub_text: String::new(),
            warmup_retry_secs: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Parse configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default config file
    /// location is tried; a missing file yields defaults with a warning.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            info!("Loaded configuration from {}", path.display());
            return Self::from_toml_str(&content);
        }

        match default_config_path() {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                info!("Loaded configuration from {}", path.display());
                Self::from_toml_str(&content)
            }
            None => {
                warn!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.admission.concurrency_limit == 0 {
            return Err(Error::Config("admission.concurrency_limit must be at least 1".into()));
        }
        if self.admission.request_timeout_secs == 0 {
            return Err(Error::Config("admission.request_timeout_secs must be at least 1".into()));
        }
        if self.admission.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(Error::Config(format!(
                "admission.request_timeout_secs ({}) exceeds {}",
                self.admission.request_timeout_secs, MAX_REQUEST_TIMEOUT_SECS
            )));
        }
        if self.ingest.max_upload_bytes == 0 {
            return Err(Error::Config("ingest.max_upload_bytes must be at least 1".into()));
        }
        if self.ingest.memory_threshold_bytes > self.ingest.max_upload_bytes {
            return Err(Error::Config(format!(
                "ingest.memory_threshold_bytes ({}) exceeds ingest.max_upload_bytes ({})",
                self.ingest.memory_threshold_bytes, self.ingest.max_upload_bytes
            )));
        }
        if self.ingest.allowed_formats.is_empty() {
            return Err(Error::Config("ingest.allowed_formats must not be empty".into()));
        }
        if self.engine.parallelism == 0 {
            return Err(Error::Config("engine.parallelism must be at least 1".into()));
        }
        if self.engine.warmup_retry_secs == 0 {
            return Err(Error::Config("engine.warmup_retry_secs must be at least 1".into()));
        }
        if self.engine.parallelism > self.admission.concurrency_limit {
            warn!(
                parallelism = self.engine.parallelism,
                concurrency_limit = self.admission.concurrency_limit,
                "engine.parallelism exceeds admission ceiling; the ceiling stays binding"
            );
        }
        if !self.engine.languages.iter().any(|l| l == &self.engine.default_language) {
            return Err(Error::Config(format!(
                "engine.default_language '{}' is not in engine.languages",
                self.engine.default_language
            )));
        }
        if self.engine.kind == EngineKind::Remote && self.engine.url.is_none() {
            return Err(Error::Config("engine.url is required for the remote engine".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.admission.request_timeout_secs)
    }

    pub fn warmup_retry(&self) -> Duration {
        Duration::from_secs(self.engine.warmup_retry_secs)
    }
}

/// Locate the config file for this platform, if one exists.
///
/// Checks `$TRANSCRIBE_CONFIG`, then the user config dir
/// (`~/.config/transcribe/config.toml` on Linux), then `/etc/transcribe/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("{} points at missing file {}", CONFIG_ENV_VAR, path.display());
    }

    let user_config = dirs::config_dir().map(|d| d.join("transcribe").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/transcribe/config.toml");
    if cfg!(unix) && system_config.exists() {
        return Some(system_config);
    }

    None
}
