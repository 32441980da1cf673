use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetOrigin {
    Upload,
    Download,
}

impl Display for AssetOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AssetOrigin::Upload => write!(f, "upload"),
            AssetOrigin::Download => write!(f, "download"),
        }
    }
}

impl FromStr for AssetOrigin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(AssetOrigin::Upload),
            "download" => Ok(AssetOrigin::Download),
            _ => Err(anyhow::anyhow!("Invalid asset origin: {}", s)),
        }
    }
}

/// A stored object the rest of the platform can reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAsset {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub origin: AssetOrigin,
    /// Session or download task that produced the object.
    pub origin_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub created_at: DateTime<Utc>,
}
