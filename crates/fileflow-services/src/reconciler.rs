//! Storage notification reconciliation
//!
//! Object-created notifications are mapped back to their session through the
//! upload key layout, the stored object is checked against the expected
//! checksum, and the session is completed through the same aggregate method
//! the synchronous API uses. Retry and the circuit breaker wrap only the
//! persistence step; the HEAD request runs once per event.

use async_trait::async_trait;
use fileflow_core::models::UploadSession;
use fileflow_core::{AppError, AppResult, ErrorMetadata};
use fileflow_infra::{
    retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, QueueMessage, QueueMessageHandler,
    RetryPolicy,
};
use fileflow_storage::{canonical_etag, parse_upload_key, ObjectStorageClient};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::session_manager::{CompletionOutcome, SessionManager};
use crate::storage_error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreatedEvent {
    pub bucket: String,
    /// As delivered: URL-encoded.
    pub key: String,
    pub etag: Option<String>,
    pub size: Option<i64>,
}

#[derive(Deserialize)]
struct EventEnvelope {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
    #[serde(rename = "Event")]
    event: Option<String>,
}

#[derive(Deserialize)]
struct EventRecord {
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: EventEntity,
}

#[derive(Deserialize)]
struct EventEntity {
    bucket: EventBucket,
    object: EventObject,
}

#[derive(Deserialize)]
struct EventBucket {
    name: String,
}

#[derive(Deserialize)]
struct EventObject {
    key: String,
    size: Option<i64>,
    #[serde(rename = "eTag")]
    e_tag: Option<String>,
}

/// Extract object-created records from an S3 event notification body.
/// Test events and other event types yield nothing.
pub fn parse_storage_event(body: &str) -> AppResult<Vec<ObjectCreatedEvent>> {
    let envelope: EventEnvelope = serde_json::from_str(body)?;
    if envelope.event.as_deref() == Some("s3:TestEvent") {
        return Ok(Vec::new());
    }
    Ok(envelope
        .records
        .into_iter()
        .filter(|r| r.event_name.starts_with("ObjectCreated"))
        .map(|r| ObjectCreatedEvent {
            bucket: r.s3.bucket.name,
            key: r.s3.object.key,
            etag: r.s3.object.e_tag,
            size: r.s3.object.size,
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(Uuid),
    /// Duplicate notification for a session already completed with this eTag.
    AlreadyCompleted(Uuid),
    /// Not an upload object, or no matching session.
    Ignored,
}

pub struct StorageEventReconciler {
    sessions: Arc<SessionManager>,
    storage: Arc<dyn ObjectStorageClient>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl StorageEventReconciler {
    pub fn new(
        sessions: Arc<SessionManager>,
        storage: Arc<dyn ObjectStorageClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            sessions,
            storage,
            retry: config.retry,
            breaker: CircuitBreaker::new("session persistence", config.breaker),
        }
    }

    #[tracing::instrument(skip(self, event), fields(key = %event.key))]
    pub async fn reconcile(&self, event: &ObjectCreatedEvent) -> AppResult<ReconcileOutcome> {
        let upload_key = match parse_upload_key(&event.key) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "Not an upload object, ignoring");
                return Ok(ReconcileOutcome::Ignored);
            }
        };

        let session = match self.sessions.find_session(upload_key.session_id).await {
            Ok(session) if session.tenant_id() == upload_key.tenant_id => session,
            Ok(_) | Err(AppError::NotFound(_)) => {
                tracing::warn!(session_id = %upload_key.session_id, "No session for uploaded object");
                return Ok(ReconcileOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };
        let session_id = session.id();
        let target = session.target().clone();

        let head = self
            .storage
            .head_object(&target.bucket, &target.key)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| AppError::NotFound(format!("object {}/{}", target.bucket, target.key)))?;
        let actual = canonical_etag(&head.etag);

        let expected = match &session {
            UploadSession::Single(s) => s.expected_checksum.clone(),
            UploadSession::Multipart(_) => None,
        }
        .or_else(|| event.etag.as_deref().map(canonical_etag));

        if let Some(expected) = expected {
            if expected != actual {
                let err = AppError::ChecksumMismatch {
                    key: target.key,
                    expected,
                    actual,
                };
                tracing::error!(error = %err, session_id = %session_id, "Stored object failed checksum verification");
                return Err(err);
            }
        }

        let outcome = self
            .breaker
            .call(|| {
                retry_with_backoff(&self.retry, is_retryable, || {
                    self.sessions.apply_storage_completion(session_id, &actual)
                })
            })
            .await?;

        Ok(match outcome {
            CompletionOutcome::Completed(s) => ReconcileOutcome::Completed(s.id()),
            CompletionOutcome::AlreadyCompleted(s) => {
                tracing::debug!(session_id = %s.id(), "Duplicate storage notification");
                ReconcileOutcome::AlreadyCompleted(s.id())
            }
        })
    }
}

/// Transient failures and lost optimistic-version races are worth another try;
/// the operation reloads the session on every attempt.
fn is_retryable(err: &AppError) -> bool {
    err.is_recoverable() || matches!(err, AppError::Conflict(_))
}

#[async_trait]
impl QueueMessageHandler for StorageEventReconciler {
    async fn handle(&self, message: &QueueMessage) -> AppResult<()> {
        let events = parse_storage_event(&message.body)?;
        let mut first_error = None;
        for event in &events {
            if let Err(e) = self.reconcile(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
