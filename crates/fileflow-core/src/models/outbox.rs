use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            OutboxStatus::Pending => write!(f, "pending"),
            OutboxStatus::Processing => write!(f, "processing"),
            OutboxStatus::Processed => write!(f, "processed"),
            OutboxStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid outbox status: {}", s)),
        }
    }
}

/// Downstream action an outbox row stands for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Pipeline,
    Transform,
    Download,
    Webhook,
}

impl Display for OutboxKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            OutboxKind::Pipeline => write!(f, "pipeline"),
            OutboxKind::Transform => write!(f, "transform"),
            OutboxKind::Download => write!(f, "download"),
            OutboxKind::Webhook => write!(f, "webhook"),
        }
    }
}

impl FromStr for OutboxKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(OutboxKind::Pipeline),
            "transform" => Ok(OutboxKind::Transform),
            "download" => Ok(OutboxKind::Download),
            "webhook" => Ok(OutboxKind::Webhook),
            _ => Err(anyhow::anyhow!("Invalid outbox kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub kind: OutboxKind,
    /// Id of the session, task or asset whose state change produced this row.
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new<P: OutboxPayload>(aggregate_id: Uuid, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind: P::kind(),
            aggregate_id,
            payload: serde_json::to_value(payload)?,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        })
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn payload_as<P: OutboxPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn can_retry(&self, max_retries: i32) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count < max_retries
    }
}

/// Trait for type-safe outbox payloads
pub trait OutboxPayload: Serialize + DeserializeOwned {
    fn kind() -> OutboxKind;
}

/// Kick off the processing pipeline for a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelinePayload {
    pub session_id: Uuid,
    pub tenant_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub etag: Option<String>,
}

impl OutboxPayload for PipelinePayload {
    fn kind() -> OutboxKind {
        OutboxKind::Pipeline
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformPayload {
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub file_asset_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub operations: serde_json::Value,
}

impl OutboxPayload for TransformPayload {
    fn kind() -> OutboxKind {
        OutboxKind::Transform
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadPayload {
    pub task_id: Uuid,
    pub tenant_id: Uuid,
}

impl OutboxPayload for DownloadPayload {
    fn kind() -> OutboxKind {
        OutboxKind::Download
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub url: String,
    pub event: String,
    pub body: serde_json::Value,
}

impl OutboxPayload for WebhookPayload {
    fn kind() -> OutboxKind {
        OutboxKind::Webhook
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_is_pending() {
        let aggregate = Uuid::new_v4();
        let msg = OutboxMessage::new(
            aggregate,
            &DownloadPayload {
                task_id: aggregate,
                tenant_id: Uuid::new_v4(),
            },
        )
        .unwrap();
        assert_eq!(msg.kind, OutboxKind::Download);
        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert!(msg.claimed_at.is_none());

        let payload: DownloadPayload = msg.payload_as().unwrap();
        assert_eq!(payload.task_id, aggregate);
    }

    #[test]
    fn test_payload_of_wrong_kind_is_rejected() {
        let msg = OutboxMessage::new(
            Uuid::new_v4(),
            &WebhookPayload {
                url: "https://hooks.example.com".to_string(),
                event: "download.completed".to_string(),
                body: serde_json::json!({}),
            },
        )
        .unwrap();
        assert!(msg.payload_as::<PipelinePayload>().is_err());
    }

    #[test]
    fn test_can_retry_only_failed_below_limit() {
        let mut msg = OutboxMessage::new(
            Uuid::new_v4(),
            &DownloadPayload {
                task_id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
            },
        )
        .unwrap();
        assert!(!msg.can_retry(3));
        msg.status = OutboxStatus::Failed;
        msg.retry_count = 2;
        assert!(msg.can_retry(3));
        msg.retry_count = 3;
        assert!(!msg.can_retry(3));
    }
}
