//! Configuration types for media-bridge

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use utoipa::ToSchema;

use crate::error::{Error, Result};

/// Artifact storage configuration (directory, TTL, sweep cadence)
///
/// Groups settings for the ephemeral artifact registry.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct StorageConfig {
    /// Directory artifact blobs are written to (default: "./artifacts")
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Time-to-live applied to registered artifacts, in seconds (default: 3600)
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,

    /// Interval between expiry sweeps, in seconds (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Results at or below this size are returned inline; larger ones are
    /// registered for link delivery (default: 50 MB)
    #[serde(default = "default_inline_limit_bytes")]
    pub inline_limit_bytes: u64,
}

impl StorageConfig {
    /// Artifact TTL as a [`Duration`]
    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    /// Sweep interval as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            inline_limit_bytes: default_inline_limit_bytes(),
        }
    }
}

/// Job poller configuration (cadence, retry ceiling, garbage collection)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PollerConfig {
    /// Interval between status poll rounds, in seconds (default: 10)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Consecutive transport failures tolerated on status polls before a job
    /// is force-failed (default: 5)
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// How long a terminal job is retained for late queries before purge,
    /// in seconds (default: 300)
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,

    /// Hard age ceiling after which a job is purged regardless of state,
    /// in seconds (default: 86400)
    #[serde(default = "default_max_job_age_secs")]
    pub max_job_age_secs: u64,

    /// Interval between garbage-collection sweeps, in seconds (default: 60)
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl PollerConfig {
    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// GC interval as a [`Duration`]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            retry_limit: default_retry_limit(),
            terminal_grace_secs: default_terminal_grace_secs(),
            max_job_age_secs: default_max_job_age_secs(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

/// Remote conversion backend client configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientConfig {
    /// Base URL of the conversion backend API
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Optional API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Timeout for control-plane calls (check/submit/status), in seconds (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for full content downloads, in seconds (default: 600)
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl ClientConfig {
    /// Control-plane timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Download timeout as a [`Duration`]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

/// Admission gate configuration (per-chat token bucket)
///
/// Consulted before any conversion request is accepted. Exempt ids bypass
/// the gate entirely (admin chats).
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    /// Whether admission checks are enforced (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained request rate allowed per chat, per minute (default: 6)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Maximum burst size per chat (default: 3)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Chat ids exempt from rate limiting
    #[serde(default)]
    pub exempt_ids: Vec<i64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            exempt_ids: Vec::new(),
        }
    }
}

/// Delivery API server configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address the delivery server binds to (default: 127.0.0.1:8780)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Public base URL used when rendering download links
    /// (default: "http://127.0.0.1:8780")
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Whether CORS headers are emitted (default: false)
    #[serde(default)]
    pub cors_enabled: bool,

    /// Allowed CORS origins; "*" or empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Whether Swagger UI is mounted at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            public_base_url: default_public_base_url(),
            cors_enabled: false,
            cors_origins: Vec::new(),
            swagger_ui: false,
        }
    }
}

/// Main configuration for media-bridge
///
/// Fields are organized into logical sub-configs:
/// - [`storage`](StorageConfig) - artifact directory, TTL, sweep cadence
/// - [`poller`](PollerConfig) - poll interval, retry ceiling, GC
/// - [`client`](ClientConfig) - conversion backend endpoint and timeouts
/// - [`api`](ApiConfig) - delivery server binding and CORS
/// - [`rate_limit`](RateLimitConfig) - per-chat admission gate
///
/// Sub-config fields are flattened for a flat JSON/TOML surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Artifact storage settings
    #[serde(flatten)]
    pub storage: StorageConfig,

    /// Job poller settings
    #[serde(flatten)]
    pub poller: PollerConfig,

    /// Conversion backend client settings
    pub client: ClientConfig,

    /// Delivery API server settings
    #[serde(flatten)]
    pub api: ApiConfig,

    /// Admission gate settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Validate semantic constraints that serde defaults cannot express
    ///
    /// Returns a [`Error::Config`] naming the offending key on failure.
    pub fn validate(&self) -> Result<()> {
        if self.storage.artifact_ttl_secs == 0 {
            return Err(Error::Config {
                message: "artifact TTL must be positive".to_string(),
                key: Some("artifact_ttl_secs".to_string()),
            });
        }
        if self.poller.poll_interval_secs == 0 {
            return Err(Error::Config {
                message: "poll interval must be positive".to_string(),
                key: Some("poll_interval_secs".to_string()),
            });
        }
        if self.poller.retry_limit == 0 {
            return Err(Error::Config {
                message: "retry limit must be at least 1".to_string(),
                key: Some("retry_limit".to_string()),
            });
        }
        if url::Url::parse(&self.client.base_url).is_err() {
            return Err(Error::Config {
                message: format!("invalid backend base URL '{}'", self.client.base_url),
                key: Some("client.base_url".to_string()),
            });
        }
        Ok(())
    }

    /// Render the public download URL for an artifact token
    pub fn download_url(&self, token: &crate::types::ArtifactToken) -> String {
        format!(
            "{}/download/{}",
            self.api.public_base_url.trim_end_matches('/'),
            token
        )
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_artifact_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_inline_limit_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_retry_limit() -> u32 {
    5
}

fn default_terminal_grace_secs() -> u64 {
    300
}

fn default_max_job_age_secs() -> u64 {
    86_400
}

fn default_gc_interval_secs() -> u64 {
    60
}

fn default_backend_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    600
}

fn default_requests_per_minute() -> u32 {
    6
}

fn default_burst_size() -> u32 {
    3
}

fn default_bind_address() -> SocketAddr {
    use std::net::{IpAddr, Ipv4Addr};
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8780)
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8780".to_string()
}

fn default_true() -> bool {
    true
}
