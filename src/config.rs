//! Configuration types for synthgate

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use utoipa::ToSchema;

/// Default chunk size for transmissions: 5 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Main configuration for the gateway and its client side
///
/// Every section has sensible defaults, so `Config::default()` runs a local
/// gateway with filesystem storage under `./temp/chunks` and `./public/uploads`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Staging and artifact storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chunked upload behaviour (chunk size, retries, limits)
    #[serde(default)]
    pub upload: UploadConfig,

    /// Task poller timing
    #[serde(default)]
    pub poll: PollConfig,

    /// Synthesis vendor connection
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// REST API server settings
    #[serde(default)]
    pub server: ApiConfig,

    /// Abandoned-session sweeping
    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl Config {
    /// Load a JSON configuration file, filling omitted fields with defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from the process environment
    ///
    /// Recognised variables:
    /// - `SYNTHGATE_API_BASE_URL` - synthesis vendor base URL
    /// - `DASHSCOPE_API_KEY` - synthesis vendor API key
    /// - `SYNTHGATE_MAX_IMAGE_SIZE` / `SYNTHGATE_MAX_VIDEO_SIZE` - byte limits
    /// - `SYNTHGATE_BIND_ADDRESS` - API bind address
    /// - `SYNTHGATE_PUBLIC_BASE_URL` - origin prefixed to relative artifact URLs
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(base_url) = std::env::var("SYNTHGATE_API_BASE_URL") {
            self.synthesis.base_url = base_url;
        }
        if let Ok(api_key) = std::env::var("DASHSCOPE_API_KEY") {
            self.synthesis.api_key = Some(api_key);
        }
        if let Ok(raw) = std::env::var("SYNTHGATE_MAX_IMAGE_SIZE") {
            self.upload.limits.max_image_bytes = parse_env("SYNTHGATE_MAX_IMAGE_SIZE", &raw)?;
        }
        if let Ok(raw) = std::env::var("SYNTHGATE_MAX_VIDEO_SIZE") {
            self.upload.limits.max_video_bytes = parse_env("SYNTHGATE_MAX_VIDEO_SIZE", &raw)?;
        }
        if let Ok(raw) = std::env::var("SYNTHGATE_BIND_ADDRESS") {
            self.server.bind_address = parse_env("SYNTHGATE_BIND_ADDRESS", &raw)?;
        }
        if let Ok(base) = std::env::var("SYNTHGATE_PUBLIC_BASE_URL") {
            self.server.public_base_url = Some(base);
        }
        Ok(())
    }

    /// Reject settings that would make the upload or poll loops misbehave
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size == 0 {
            return Err(config_error("chunk size must be at least 1 byte", "upload.chunk_size"));
        }
        if self.upload.retry.max_attempts == 0 {
            return Err(config_error(
                "at least one attempt per chunk is required",
                "upload.retry.max_attempts",
            ));
        }
        if self.poll.initial_interval.is_zero() {
            return Err(config_error(
                "poll interval must be positive",
                "poll.initial_interval",
            ));
        }
        if self.poll.max_interval < self.poll.initial_interval {
            return Err(config_error(
                "max poll interval is smaller than the initial interval",
                "poll.max_interval",
            ));
        }
        if self.poll.max_failures == 0 {
            return Err(config_error(
                "failure cap must be at least 1",
                "poll.max_failures",
            ));
        }
        if self.poll.backoff_factor < 1.0 {
            return Err(config_error(
                "backoff factor must not shrink the interval",
                "poll.backoff_factor",
            ));
        }
        if let Some(base) = &self.server.public_base_url
            && url::Url::parse(base).is_err()
        {
            return Err(config_error(
                "public base URL is not an absolute URL",
                "server.public_base_url",
            ));
        }
        validate_public_path(&self.storage.public_path)?;
        if self.storage.backend == StorageBackend::Object && self.storage.object.bucket.is_empty() {
            return Err(config_error(
                "object storage requires a bucket",
                "storage.object.bucket",
            ));
        }
        Ok(())
    }
}

/// Prefixes owned by the API, documentation and health routes
const RESERVED_PREFIXES: [&str; 5] = ["/api", "/api-docs", "/swagger-ui", "/health", "/openapi.json"];

/// The artifact route is `<public_path>/:name`; axum panics on paths it cannot mount
fn validate_public_path(public_path: &str) -> Result<()> {
    const KEY: &str = "storage.public_path";
    let trimmed = public_path.trim_end_matches('/');
    if !public_path.starts_with('/') {
        return Err(config_error("public path must start with '/'", KEY));
    }
    if trimmed.contains("//")
        || trimmed
            .chars()
            .any(|c| matches!(c, ':' | '*' | '{' | '}' | '?' | '#') || c.is_whitespace())
    {
        return Err(config_error(
            "public path must be a plain path without wildcards or empty segments",
            KEY,
        ));
    }
    let collides = RESERVED_PREFIXES
        .iter()
        .any(|reserved| trimmed == *reserved || trimmed.starts_with(&format!("{reserved}/")));
    if collides {
        return Err(config_error(
            "public path collides with an API route",
            KEY,
        ));
    }
    Ok(())
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| Error::Config {
        message: format!("invalid value {raw:?}: {e}"),
        key: Some(key.to_string()),
    })
}

/// Which storage implementation backs staging and artifacts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Local directories (default)
    #[default]
    Filesystem,
    /// S3-compatible object storage
    Object,
    /// Process memory, lost on restart
    Memory,
}

/// Staging and artifact storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct StorageConfig {
    /// Backend selection (default: filesystem)
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory holding staged chunks (default: "./temp/chunks")
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Directory holding assembled artifacts (default: "./public/uploads")
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// URL path prefix under which artifacts are served (default: "/uploads")
    #[serde(default = "default_public_path")]
    pub public_path: String,

    /// Object storage settings, used when `backend` is `object`
    #[serde(default)]
    pub object: ObjectStoreConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            staging_dir: default_staging_dir(),
            artifact_dir: default_artifact_dir(),
            public_path: default_public_path(),
            object: ObjectStoreConfig::default(),
        }
    }
}

/// S3-compatible object storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ObjectStoreConfig {
    /// Endpoint URL; `None` means `https://<bucket>.s3.<region>.amazonaws.com`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bucket name
    #[serde(default)]
    pub bucket: String,

    /// Region used for request signing (default: "us-east-1")
    #[serde(default = "default_region")]
    pub region: String,

    /// Access key id
    #[serde(default)]
    pub access_key_id: String,

    /// Secret access key
    #[serde(default)]
    pub secret_access_key: String,

    /// Key prefix for staged chunks (default: "staging/")
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Key prefix for artifacts (default: "uploads/")
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            staging_prefix: default_staging_prefix(),
            artifact_prefix: default_artifact_prefix(),
        }
    }
}

/// Chunked upload configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadConfig {
    /// Bytes per chunk (default: 5 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per-chunk retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Accepted media types and sizes
    #[serde(default)]
    pub limits: MediaLimits,

    /// Largest request body the gateway accepts (default: 128 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retry: RetryConfig::default(),
            limits: MediaLimits::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Retry configuration for chunk sends
///
/// With the defaults a chunk is attempted 3 times, waiting 2s and then 4s
/// between attempts.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Media types and sizes accepted for upload
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MediaLimits {
    /// Largest accepted image in bytes (default: 10 MiB)
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,

    /// Largest accepted video in bytes (default: 100 MiB)
    #[serde(default = "default_max_video_bytes")]
    pub max_video_bytes: u64,

    /// Accepted image extensions, lowercase without dot
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Accepted video extensions, lowercase without dot
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            max_video_bytes: default_max_video_bytes(),
            image_extensions: default_image_extensions(),
            video_extensions: default_video_extensions(),
        }
    }
}

/// Task poller timing
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PollConfig {
    /// Interval between status queries (default: 3 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub initial_interval: Duration,

    /// Upper bound for the backed-off interval (default: 10 seconds)
    #[serde(default = "default_max_poll_interval", with = "duration_serde")]
    pub max_interval: Duration,

    /// Overall time budget from start of polling (default: 300 seconds)
    #[serde(default = "default_poll_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Consecutive failed queries before giving up (default: 3)
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Interval growth after a failed query (default: 1.5)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_poll_interval(),
            max_interval: default_max_poll_interval(),
            timeout: default_poll_timeout(),
            max_failures: default_max_failures(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Synthesis vendor configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SynthesisConfig {
    /// Vendor base URL (default: "https://dashscope.aliyuncs.com")
    #[serde(default = "default_synthesis_base_url")]
    pub base_url: String,

    /// Bearer token for the vendor
    #[serde(default)]
    pub api_key: Option<String>,

    /// Vendor model identifier (default: "wan2.2-animate-mix")
    #[serde(default = "default_vendor_model")]
    pub vendor_model: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: default_synthesis_base_url(),
            api_key: None,
            vendor_model: default_vendor_model(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:3000)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: true)
    #[serde(default = "default_true")]
    pub swagger_ui: bool,

    /// Cache lifetime advertised for artifacts (default: 24 hours)
    #[serde(default = "default_cache_max_age", with = "duration_serde")]
    pub artifact_cache_max_age: Duration,

    /// Externally reachable origin, e.g. "https://media.example.com"
    ///
    /// When set, artifact paths such as `/uploads/x.mp4` passed to
    /// create-task are joined onto it before reaching the vendor.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_key: None,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: true,
            artifact_cache_max_age: default_cache_max_age(),
            public_base_url: None,
        }
    }
}

/// Abandoned-session sweeping
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct JanitorConfig {
    /// How often to sweep; zero disables the janitor (default: 10 minutes)
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Staged chunks older than this are deleted (default: 24 hours)
    #[serde(default = "default_max_chunk_age", with = "duration_serde")]
    pub max_age: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            max_age: default_max_chunk_age(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./temp/chunks")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./public/uploads")
}

fn default_public_path() -> String {
    "/uploads".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_staging_prefix() -> String {
    "staging/".to_string()
}

fn default_artifact_prefix() -> String {
    "uploads/".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_body_bytes() -> usize {
    128 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_image_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_video_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".into(), "jpeg".into(), "png".into(), "webp".into()]
}

fn default_video_extensions() -> Vec<String> {
    vec!["mp4".into(), "mov".into(), "avi".into()]
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_failures() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_synthesis_base_url() -> String {
    "https://dashscope.aliyuncs.com".to_string()
}

fn default_vendor_model() -> String {
    "wan2.2-animate-mix".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_chunk_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
