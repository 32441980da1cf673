//! Configuration module
//!
//! Settings are read from the environment (a `.env` file is loaded first when
//! present). Every tunable has a default; only the database URL and the bucket
//! are mandatory.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Parse an environment variable, falling back to `default` when it is unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct FileFlowConfig {
    pub environment: String,
    pub log_format: LogFormat,
    // Database
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    // Object storage
    pub s3_bucket: String,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>, // S3-compatible providers (MinIO, LocalStack, ...)
    pub presigned_url_ttl_secs: u64,
    // Upload sessions
    pub session_ttl_secs: i64,
    pub multipart_part_size_bytes: i64,
    pub session_cache_capacity: usize,
    pub session_cache_ttl_secs: u64,
    // Queues
    pub pipeline_queue: String,
    pub transform_queue: String,
    pub download_queue: String,
    pub storage_event_queue: Option<String>,
    pub sqs_endpoint: Option<String>,
    pub queue_max_messages: i32,
    pub queue_wait_time_secs: i32,
    pub queue_visibility_timeout_secs: i32,
    // Outbox
    pub outbox_workers: usize,
    pub outbox_channel_capacity: usize,
    pub outbox_max_retries: i32,
    pub outbox_sweep_interval_secs: u64,
    pub outbox_pending_grace_secs: i64,
    pub outbox_processing_stale_secs: i64,
    pub outbox_sweep_batch_size: i64,
    // Session expiration
    pub expiration_sweep_interval_secs: u64,
    pub expiration_batch_size: i64,
    // Downloads
    pub download_max_retries: i32,
    pub download_timeout_secs: u64,
    pub download_max_bytes: u64,
    /// An IN_PROGRESS task older than this is treated as an abandoned attempt.
    pub download_stale_secs: i64,
    // Webhooks
    pub webhook_timeout_secs: u64,
    pub webhook_signing_secret: Option<String>,
    // Storage event reconciliation
    pub reconciler_max_attempts: u32,
    pub reconciler_initial_backoff_ms: u64,
    pub reconciler_max_backoff_ms: u64,
    pub reconciler_backoff_multiplier: f64,
    pub reconciler_breaker_threshold: u32,
    pub reconciler_breaker_open_secs: u64,
}

impl FileFlowConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const PRESIGNED_URL_TTL_SECS: u64 = 900;
        const SESSION_TTL_SECS: i64 = 24 * 3600;
        const MULTIPART_PART_SIZE_BYTES: i64 = 8 * 1024 * 1024;
        const SESSION_CACHE_CAPACITY: usize = 10_000;
        const SESSION_CACHE_TTL_SECS: u64 = 300;
        const QUEUE_MAX_MESSAGES: i32 = 10;
        const QUEUE_WAIT_TIME_SECS: i32 = 20;
        const QUEUE_VISIBILITY_TIMEOUT_SECS: i32 = 30;
        const OUTBOX_WORKERS: usize = 8;
        const OUTBOX_CHANNEL_CAPACITY: usize = 1024;
        const OUTBOX_MAX_RETRIES: i32 = 3;
        const OUTBOX_SWEEP_INTERVAL_SECS: u64 = 30;
        const OUTBOX_PENDING_GRACE_SECS: i64 = 60;
        const OUTBOX_PROCESSING_STALE_SECS: i64 = 300;
        const OUTBOX_SWEEP_BATCH_SIZE: i64 = 100;
        const EXPIRATION_SWEEP_INTERVAL_SECS: u64 = 300;
        const EXPIRATION_BATCH_SIZE: i64 = 100;
        const DOWNLOAD_MAX_RETRIES: i32 = 3;
        const DOWNLOAD_TIMEOUT_SECS: u64 = 60;
        const DOWNLOAD_MAX_BYTES: u64 = 500 * 1024 * 1024;
        const DOWNLOAD_STALE_SECS: i64 = 900;
        const WEBHOOK_TIMEOUT_SECS: u64 = 10;
        const RECONCILER_MAX_ATTEMPTS: u32 = 3;
        const RECONCILER_INITIAL_BACKOFF_MS: u64 = 1000;
        const RECONCILER_MAX_BACKOFF_MS: u64 = 10_000;
        const RECONCILER_BACKOFF_MULTIPLIER: f64 = 2.0;
        const RECONCILER_BREAKER_THRESHOLD: u32 = 5;
        const RECONCILER_BREAKER_OPEN_SECS: u64 = 30;

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let config = FileFlowConfig {
            environment,
            log_format,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            s3_bucket: env::var("S3_BUCKET").map_err(|_| anyhow::anyhow!("S3_BUCKET must be set"))?,
            s3_region: env_opt("S3_REGION").or_else(|| env_opt("AWS_REGION")),
            s3_endpoint: env_opt("S3_ENDPOINT"),
            presigned_url_ttl_secs: env_or("PRESIGNED_URL_TTL_SECS", PRESIGNED_URL_TTL_SECS),
            session_ttl_secs: env_or("SESSION_TTL_SECS", SESSION_TTL_SECS),
            multipart_part_size_bytes: env_or("MULTIPART_PART_SIZE_BYTES", MULTIPART_PART_SIZE_BYTES),
            session_cache_capacity: env_or("SESSION_CACHE_CAPACITY", SESSION_CACHE_CAPACITY),
            session_cache_ttl_secs: env_or("SESSION_CACHE_TTL_SECS", SESSION_CACHE_TTL_SECS),
            pipeline_queue: env::var("PIPELINE_QUEUE_URL")
                .unwrap_or_else(|_| "fileflow-pipeline".to_string()),
            transform_queue: env::var("TRANSFORM_QUEUE_URL")
                .unwrap_or_else(|_| "fileflow-transform".to_string()),
            download_queue: env::var("DOWNLOAD_QUEUE_URL")
                .unwrap_or_else(|_| "fileflow-download".to_string()),
            storage_event_queue: env_opt("STORAGE_EVENT_QUEUE_URL"),
            sqs_endpoint: env_opt("SQS_ENDPOINT"),
            queue_max_messages: env_or("QUEUE_MAX_MESSAGES", QUEUE_MAX_MESSAGES),
            queue_wait_time_secs: env_or("QUEUE_WAIT_TIME_SECS", QUEUE_WAIT_TIME_SECS),
            queue_visibility_timeout_secs: env_or(
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                QUEUE_VISIBILITY_TIMEOUT_SECS,
            ),
            outbox_workers: env_or("OUTBOX_WORKERS", OUTBOX_WORKERS),
            outbox_channel_capacity: env_or("OUTBOX_CHANNEL_CAPACITY", OUTBOX_CHANNEL_CAPACITY),
            outbox_max_retries: env_or("OUTBOX_MAX_RETRIES", OUTBOX_MAX_RETRIES),
            outbox_sweep_interval_secs: env_or(
                "OUTBOX_SWEEP_INTERVAL_SECS",
                OUTBOX_SWEEP_INTERVAL_SECS,
            ),
            outbox_pending_grace_secs: env_or("OUTBOX_PENDING_GRACE_SECS", OUTBOX_PENDING_GRACE_SECS),
            outbox_processing_stale_secs: env_or(
                "OUTBOX_PROCESSING_STALE_SECS",
                OUTBOX_PROCESSING_STALE_SECS,
            ),
            outbox_sweep_batch_size: env_or("OUTBOX_SWEEP_BATCH_SIZE", OUTBOX_SWEEP_BATCH_SIZE),
            expiration_sweep_interval_secs: env_or(
                "EXPIRATION_SWEEP_INTERVAL_SECS",
                EXPIRATION_SWEEP_INTERVAL_SECS,
            ),
            expiration_batch_size: env_or("EXPIRATION_BATCH_SIZE", EXPIRATION_BATCH_SIZE),
            download_max_retries: env_or("DOWNLOAD_MAX_RETRIES", DOWNLOAD_MAX_RETRIES),
            download_timeout_secs: env_or("DOWNLOAD_TIMEOUT_SECS", DOWNLOAD_TIMEOUT_SECS),
            download_max_bytes: env_or("DOWNLOAD_MAX_BYTES", DOWNLOAD_MAX_BYTES),
            download_stale_secs: env_or("DOWNLOAD_STALE_SECS", DOWNLOAD_STALE_SECS),
            webhook_timeout_secs: env_or("WEBHOOK_TIMEOUT_SECS", WEBHOOK_TIMEOUT_SECS),
            webhook_signing_secret: env_opt("WEBHOOK_SIGNING_SECRET"),
            reconciler_max_attempts: env_or("RECONCILER_MAX_ATTEMPTS", RECONCILER_MAX_ATTEMPTS),
            reconciler_initial_backoff_ms: env_or(
                "RECONCILER_INITIAL_BACKOFF_MS",
                RECONCILER_INITIAL_BACKOFF_MS,
            ),
            reconciler_max_backoff_ms: env_or(
                "RECONCILER_MAX_BACKOFF_MS",
                RECONCILER_MAX_BACKOFF_MS,
            ),
            reconciler_backoff_multiplier: env_or(
                "RECONCILER_BACKOFF_MULTIPLIER",
                RECONCILER_BACKOFF_MULTIPLIER,
            ),
            reconciler_breaker_threshold: env_or(
                "RECONCILER_BREAKER_THRESHOLD",
                RECONCILER_BREAKER_THRESHOLD,
            ),
            reconciler_breaker_open_secs: env_or(
                "RECONCILER_BREAKER_OPEN_SECS",
                RECONCILER_BREAKER_OPEN_SECS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }
        if self.s3_bucket.trim().is_empty() {
            return Err(anyhow::anyhow!("S3_BUCKET must not be empty"));
        }
        // Outbox workers each hold a connection while claiming; leave room for requests.
        if self.db_max_connections as usize <= self.outbox_workers {
            return Err(anyhow::anyhow!(
                "DB_MAX_CONNECTIONS must be greater than OUTBOX_WORKERS"
            ));
        }
        if self.db_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("DB_TIMEOUT_SECONDS must be at least 1"));
        }
        if self.outbox_workers == 0 || self.outbox_channel_capacity == 0 {
            return Err(anyhow::anyhow!(
                "OUTBOX_WORKERS and OUTBOX_CHANNEL_CAPACITY must be greater than zero"
            ));
        }
        if self.outbox_max_retries < 0 || self.download_max_retries < 0 {
            return Err(anyhow::anyhow!("Retry limits must not be negative"));
        }
        if self.download_stale_secs <= self.download_timeout_secs as i64 {
            return Err(anyhow::anyhow!(
                "DOWNLOAD_STALE_SECS must be greater than DOWNLOAD_TIMEOUT_SECS"
            ));
        }
        if self.reconciler_max_attempts == 0 {
            return Err(anyhow::anyhow!("RECONCILER_MAX_ATTEMPTS must be at least 1"));
        }
        if !(1..=10).contains(&self.queue_max_messages) {
            return Err(anyhow::anyhow!("QUEUE_MAX_MESSAGES must be between 1 and 10"));
        }
        Ok(())
    }
}

/// Shared, cheaply clonable handle to the loaded configuration
#[derive(Clone, Debug)]
pub struct Config(pub Box<FileFlowConfig>);

impl Config {
    fn inner(&self) -> &FileFlowConfig {
        &self.0
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = FileFlowConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn settings(&self) -> &FileFlowConfig {
        self.inner()
    }

    pub fn database_url(&self) -> &str {
        &self.inner().database_url
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().db_timeout_seconds
    }

    pub fn presigned_url_ttl(&self) -> Duration {
        Duration::from_secs(self.inner().presigned_url_ttl_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inner().session_ttl_secs)
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.inner().session_cache_ttl_secs)
    }

    pub fn outbox_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.inner().outbox_sweep_interval_secs)
    }

    pub fn expiration_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.inner().expiration_sweep_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().download_timeout_secs)
    }

    pub fn download_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inner().download_stale_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().webhook_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileFlowConfig {
        FileFlowConfig {
            environment: "test".to_string(),
            log_format: LogFormat::Pretty,
            database_url: "postgres://localhost/fileflow".to_string(),
            db_max_connections: 5,
            db_timeout_seconds: 5,
            s3_bucket: "uploads".to_string(),
            s3_region: None,
            s3_endpoint: None,
            presigned_url_ttl_secs: 900,
            session_ttl_secs: 3600,
            multipart_part_size_bytes: 8 * 1024 * 1024,
            session_cache_capacity: 100,
            session_cache_ttl_secs: 60,
            pipeline_queue: "pipeline".to_string(),
            transform_queue: "transform".to_string(),
            download_queue: "download".to_string(),
            storage_event_queue: None,
            sqs_endpoint: None,
            queue_max_messages: 10,
            queue_wait_time_secs: 20,
            queue_visibility_timeout_secs: 30,
            outbox_workers: 4,
            outbox_channel_capacity: 64,
            outbox_max_retries: 3,
            outbox_sweep_interval_secs: 30,
            outbox_pending_grace_secs: 60,
            outbox_processing_stale_secs: 300,
            outbox_sweep_batch_size: 100,
            expiration_sweep_interval_secs: 300,
            expiration_batch_size: 100,
            download_max_retries: 3,
            download_timeout_secs: 60,
            download_max_bytes: 1024,
            download_stale_secs: 900,
            webhook_timeout_secs: 10,
            webhook_signing_secret: None,
            reconciler_max_attempts: 3,
            reconciler_initial_backoff_ms: 1000,
            reconciler_max_backoff_ms: 10_000,
            reconciler_backoff_multiplier: 2.0,
            reconciler_breaker_threshold: 5,
            reconciler_breaker_open_secs: 30,
        }
    }

    #[test]
    fn test_sample_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_postgres_url() {
        let mut config = sample();
        config.database_url = "mysql://localhost/fileflow".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = sample();
        config.outbox_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_download_staleness_within_fetch_timeout() {
        let mut config = sample();
        config.download_stale_secs = config.download_timeout_secs as i64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_must_outsize_outbox_workers() {
        let mut config = sample();
        config.db_max_connections = config.outbox_workers as u32;
        assert!(config.validate().is_err());
        config.db_max_connections += 1;
        assert!(config.validate().is_ok());
        config.db_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("FILEFLOW_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("FILEFLOW_TEST_ENV_OR", 7u32), 7);
        std::env::set_var("FILEFLOW_TEST_ENV_OR", " 12 ");
        assert_eq!(env_or("FILEFLOW_TEST_ENV_OR", 7u32), 12);
        std::env::remove_var("FILEFLOW_TEST_ENV_OR");
    }

    #[test]
    fn test_production_detection() {
        let mut inner = sample();
        inner.environment = "Production".to_string();
        assert!(Config(Box::new(inner)).is_production());
    }
}
