use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the image storage service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Blob backend selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// S3 configuration (used when `storage.backend = "s3"`)
    #[serde(default)]
    pub s3: S3Config,
    /// Key-value metadata index
    #[serde(default)]
    pub redis: RedisConfig,
    /// Derived format conversion
    #[serde(default)]
    pub conversion: ConversionConfig,
    /// Expiry sweeps
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Listing queries and cache
    #[serde(default)]
    pub listing: ListingConfig,
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
    /// Grace period for draining background work on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Which blob backend to use
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Root directory for the local backend
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// Deadline for a single blob operation in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for image storage
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
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Keys per DeleteObjects request
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    /// Keys per ListObjectsV2 page
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i32,
}

/// Redis index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection URL; unset runs in filesystem-scan mode
    pub url: Option<String>,
    /// Prefix for every key written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-command timeout in seconds
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// Conversion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConversionConfig {
    /// Produce derived formats at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of concurrent conversion workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs buffered before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// WebP quality (0-100)
    #[serde(default = "default_webp_quality")]
    pub webp_quality: u8,
    /// AVIF quality (0-100)
    #[serde(default = "default_avif_quality")]
    pub avif_quality: u8,
    /// AVIF encoder speed (0 slowest - 10 fastest)
    #[serde(default = "default_avif_speed")]
    pub avif_speed: u8,
    /// Path to the cwebp binary
    #[serde(default = "default_cwebp_path")]
    pub cwebp_path: String,
    /// Path to the avifenc binary
    #[serde(default = "default_avifenc_path")]
    pub avifenc_path: String,
    /// Maximum runtime of a single encoder invocation
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,
}

/// Expiry cleaner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Run periodic sweeps
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    /// Per-record deadline in seconds
    #[serde(default = "default_record_timeout_secs")]
    pub record_timeout_secs: u64,
}

/// Listing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Cached pages kept before the cache is reset
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

// Default value functions
fn default_service_name() -> String {
    "imgpool-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_backend() -> BackendKind {
    BackendKind::Local
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_delete_batch_size() -> usize {
    1000
}

fn default_list_page_size() -> i32 {
    1000
}

fn default_key_prefix() -> String {
    "imgpool".to_string()
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_webp_quality() -> u8 {
    80
}

fn default_avif_quality() -> u8 {
    60
}

fn default_avif_speed() -> u8 {
    6
}

fn default_cwebp_path() -> String {
    "cwebp".to_string()
}

fn default_avifenc_path() -> String {
    "avifenc".to_string()
}

fn default_encode_timeout_secs() -> u64 {
    120
}

fn default_cleanup_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_record_timeout_secs() -> u64 {
    10
}

fn default_page_size() -> usize {
    20
}

fn default_max_page_size() -> usize {
    100
}

fn default_cache_max_entries() -> usize {
    1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "imgpool-storage")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/imgpool").required(false))
            .add_source(config::File::with_name("/etc/imgpool/storage").required(false))
            // Override with environment variables
            // IMGPOOL__REDIS__URL -> redis.url
            .add_source(
                config::Environment::with_prefix("IMGPOOL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.conversion.workers == 0 {
            anyhow::bail!("conversion.workers must be at least 1");
        }
        if self.conversion.queue_capacity == 0 {
            anyhow::bail!("conversion.queue_capacity must be at least 1");
        }
        if self.listing.default_page_size == 0 || self.listing.max_page_size == 0 {
            anyhow::bail!("listing page sizes must be at least 1");
        }
        if self.storage.backend == BackendKind::S3 && self.s3.bucket.is_empty() {
            anyhow::bail!("s3.bucket is required when storage.backend = \"s3\"");
        }
        Ok(())
    }

    /// Deadline for a single blob operation
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.request_timeout_secs)
    }

    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs.max(1))
    }

    /// Get per-record cleanup deadline as Duration
    pub fn cleanup_record_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup.record_timeout_secs)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_grace_secs)
    }
}

impl RedisConfig {
    /// Per-command deadline, at least one second
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

impl ConversionConfig {
    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_root: default_local_root(),
            request_timeout_secs: default_request_timeout_secs(),
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
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            delete_batch_size: default_delete_batch_size(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            webp_quality: default_webp_quality(),
            avif_quality: default_avif_quality(),
            avif_speed: default_avif_speed(),
            cwebp_path: default_cwebp_path(),
            avifenc_path: default_avifenc_path(),
            encode_timeout_secs: default_encode_timeout_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval_secs(),
            record_timeout_secs: default_record_timeout_secs(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}
