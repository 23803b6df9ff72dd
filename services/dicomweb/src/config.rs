use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the DICOMweb service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
    Memory,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend kind: local, s3 or memory
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the local backend
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// S3 settings for the s3 backend
    #[serde(default)]
    pub s3: S3Config,
    /// Age after which a compare-and-swap guard file is considered abandoned
    #[serde(default = "default_guard_lease_secs")]
    pub guard_lease_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix under which the layout is rooted
    pub prefix: Option<String>,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Binary attributes strictly larger than this move to bulk storage
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold_bytes: usize,
    /// Concurrent bulk writes per instance and concurrent instances per batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Compare-and-swap attempts before reporting contention
    #[serde(default = "default_max_merge_attempts")]
    pub max_merge_attempts: u32,
    /// First backoff interval in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Backoff interval cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Attempts per storage call before the instance fails
    #[serde(default = "default_io_attempts")]
    pub io_attempts: u32,
}

/// Query configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Result limit when the request names none
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,
    /// Upper bound on any requested limit
    #[serde(default = "default_max_query_limit")]
    pub max_limit: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "static-dicomweb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_guard_lease_secs() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bulk_threshold() -> usize {
    1024
}

fn default_concurrency() -> usize {
    8
}

fn default_max_merge_attempts() -> u32 {
    16
}

fn default_backoff_initial_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    1000
}

fn default_io_attempts() -> u32 {
    3
}

fn default_query_limit() -> usize {
    100
}

fn default_max_query_limit() -> usize {
    1000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024 // 512MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "static-dicomweb")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/dicomweb").required(false))
            .add_source(config::File::with_name("/etc/dicomweb/dicomweb").required(false))
            // DICOMWEB__STORAGE__ROOT_DIR -> storage.root_dir
            .add_source(
                config::Environment::with_prefix("DICOMWEB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_empty() {
            anyhow::bail!("storage.s3.bucket is required for the s3 backend");
        }
        if self.ingest.concurrency == 0 {
            anyhow::bail!("ingest.concurrency must be at least 1");
        }
        if self.ingest.max_merge_attempts == 0 || self.ingest.io_attempts == 0 {
            anyhow::bail!("ingest retry attempts must be at least 1");
        }
        if self.ingest.backoff_initial_ms > self.ingest.backoff_max_ms {
            anyhow::bail!("ingest.backoff_initial_ms exceeds ingest.backoff_max_ms");
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            anyhow::bail!("query.default_limit must be between 1 and query.max_limit");
        }
        Ok(())
    }
}

impl StorageConfig {
    pub fn guard_lease(&self) -> Duration {
        Duration::from_secs(self.guard_lease_secs)
    }
}

impl IngestConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root_dir: default_root_dir(),
            s3: S3Config::default(),
            guard_lease_secs: default_guard_lease_secs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            prefix: None,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bulk_threshold_bytes: default_bulk_threshold(),
            concurrency: default_concurrency(),
            max_merge_attempts: default_max_merge_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            io_attempts: default_io_attempts(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_query_limit(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
