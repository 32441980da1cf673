//! Shared key generation for stored objects.
//!
//! Key format: `uploads/{tenant_id}/{session_id}/{file_name}` for upload sessions,
//! `downloads/{tenant_id}/{task_id}/{file_name}` for fetched resources.

use uuid::Uuid;

use crate::traits::{StorageError, StorageResult};

const UPLOAD_PREFIX: &str = "uploads";
const DOWNLOAD_PREFIX: &str = "downloads";

/// Identifiers recovered from an upload object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadKey {
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub file_name: String,
}

fn sanitize_file_name(file_name: &str) -> StorageResult<String> {
    let name = file_name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidKey(format!(
            "invalid file name: {:?}",
            file_name
        )));
    }
    Ok(name.replace(['/', '\\'], "_"))
}

pub fn upload_object_key(tenant_id: Uuid, session_id: Uuid, file_name: &str) -> StorageResult<String> {
    Ok(format!(
        "{}/{}/{}/{}",
        UPLOAD_PREFIX,
        tenant_id,
        session_id,
        sanitize_file_name(file_name)?
    ))
}

pub fn download_object_key(tenant_id: Uuid, task_id: Uuid, file_name: &str) -> StorageResult<String> {
    Ok(format!(
        "{}/{}/{}/{}",
        DOWNLOAD_PREFIX,
        tenant_id,
        task_id,
        sanitize_file_name(file_name)?
    ))
}

/// Map an upload object key back to its session.
///
/// Keys in storage notifications arrive URL-encoded (`+` for spaces), so the key
/// is decoded before parsing.
pub fn parse_upload_key(key: &str) -> StorageResult<UploadKey> {
    let decoded = urlencoding::decode(&key.replace('+', " "))
        .map_err(|e| StorageError::InvalidKey(format!("{}: {}", key, e)))?
        .into_owned();

    let mut segments = decoded.splitn(4, '/');
    let (Some(prefix), Some(tenant), Some(session), Some(file_name)) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(StorageError::InvalidKey(decoded));
    };

    if prefix != UPLOAD_PREFIX || file_name.is_empty() {
        return Err(StorageError::InvalidKey(decoded));
    }
    let tenant_id =
        Uuid::parse_str(tenant).map_err(|_| StorageError::InvalidKey(decoded.clone()))?;
    let session_id =
        Uuid::parse_str(session).map_err(|_| StorageError::InvalidKey(decoded.clone()))?;

    Ok(UploadKey {
        tenant_id,
        session_id,
        file_name: file_name.to_string(),
    })
}
