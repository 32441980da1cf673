//! Object storage abstraction
//!
//! Defines the operations the upload and download flows need from the storage
//! provider. Provider failures surface as `StorageError::Unavailable`; a missing
//! object is `Ok(None)` rather than an error.

use async_trait::async_trait;
use bytes::Bytes;
use fileflow_core::models::CompletedPart;
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// What a HEAD request reports about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: i64,
    /// Entity tag with surrounding quotes removed.
    pub etag: String,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Presigned PUT url for a single-request upload
    async fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Start a multipart upload and return the provider upload id
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Presigned PUT url for one part of a multipart upload
    async fn generate_presigned_part_url(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Finalize a multipart upload; returns the object's eTag
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMetadata>>;

    /// Store a complete object; returns its eTag
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> StorageResult<String>;
}

/// Strip the quotes providers wrap around entity tags.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// The form eTags and checksums are stored and compared in: unquoted, lowercase.
pub fn canonical_etag(etag: &str) -> String {
    normalize_etag(etag).to_ascii_lowercase()
}
