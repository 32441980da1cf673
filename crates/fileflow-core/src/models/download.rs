use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl Display for DownloadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DownloadStatus::Queued => write!(f, "queued"),
            DownloadStatus::InProgress => write!(f, "in_progress"),
            DownloadStatus::Completed => write!(f, "completed"),
            DownloadStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DownloadStatus::Queued),
            "in_progress" => Ok(DownloadStatus::InProgress),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid download status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadDestination {
    pub bucket: String,
    pub key: String,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Another attempt is owed; the caller must enqueue a retry message.
    RetryScheduled,
    /// `retry_count == max_retries`; the task stays FAILED for good.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_url: String,
    pub destination: DownloadDestination,
    pub status: DownloadStatus,
    /// Number of retry attempts already started.
    pub retry_count: i32,
    pub max_retries: i32,
    pub callback_url: Option<String>,
    pub last_error: Option<String>,
    pub file_asset_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(
        tenant_id: Uuid,
        source_url: String,
        destination: DownloadDestination,
        max_retries: i32,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            source_url,
            destination,
            status: DownloadStatus::Queued,
            retry_count: 0,
            max_retries,
            callback_url,
            last_error: None,
            file_asset_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// A task may be started when freshly queued, when it failed with a
    /// retry still owed, or when an attempt started before `stale_before` was
    /// abandoned mid-transfer and a retry is still owed.
    pub fn can_start(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            DownloadStatus::Queued => true,
            DownloadStatus::Failed => self.can_retry(),
            DownloadStatus::InProgress => self.is_stale(stale_before) && self.can_retry(),
            DownloadStatus::Completed => false,
        }
    }

    /// IN_PROGRESS since before `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == DownloadStatus::InProgress
            && self.started_at.is_some_and(|started| started < stale_before)
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            DownloadStatus::Completed => true,
            DownloadStatus::Failed => !self.can_retry(),
            DownloadStatus::Queued | DownloadStatus::InProgress => false,
        }
    }

    /// Returns false and leaves the task untouched if it cannot start.
    /// Restarting a failed or abandoned attempt uses up one retry.
    pub fn start(&mut self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        if !self.can_start(stale_before) {
            return false;
        }
        if self.status != DownloadStatus::Queued {
            self.retry_count += 1;
        }
        self.status = DownloadStatus::InProgress;
        self.started_at = Some(now);
        true
    }

    pub fn complete(&mut self, file_asset_id: Uuid, now: DateTime<Utc>) {
        self.status = DownloadStatus::Completed;
        self.file_asset_id = Some(file_asset_id);
        self.last_error = None;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> FailureDisposition {
        self.status = DownloadStatus::Failed;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        if self.can_retry() {
            FailureDisposition::RetryScheduled
        } else {
            FailureDisposition::Exhausted
        }
    }
}

/// Message body placed on the download work queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadQueueMessage {
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    /// 0 for the first attempt.
    pub attempt: i32,
}
