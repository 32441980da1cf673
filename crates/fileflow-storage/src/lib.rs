//! Fileflow Storage Library
//!
//! The `ObjectStorageClient` port consumed by the upload and download flows,
//! plus an S3 implementation.
//!
//! # Storage key format
//!
//! - **Uploads**: `uploads/{tenant_id}/{session_id}/{file_name}`
//! - **Downloads**: `downloads/{tenant_id}/{task_id}/{file_name}`
//!
//! Storage notifications are mapped back to a session through this layout, so key
//! generation and parsing are centralized in the `keys` module.

pub mod keys;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use keys::{download_object_key, parse_upload_key, upload_object_key, UploadKey};
#[cfg(feature = "storage-s3")]
pub use s3::S3ObjectStorage;
pub use traits::{
    canonical_etag, ObjectMetadata, ObjectStorageClient, StorageError, StorageResult,
};
