//! Collaborator ports
//!
//! Trait interfaces for the external systems the core drives: the work queue,
//! webhook endpoints, remote HTTP sources and the session cache. Concrete
//! adapters live in `fileflow-infra`; tests plug in fakes.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::UploadSession;

/// Publishes a message onto a named work queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Returns false on failure instead of erroring, so callers must check it.
    async fn publish(&self, queue: &str, message: &serde_json::Value) -> bool;
}

/// Delivers webhook callbacks.
#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    /// Errors on connection failure or any non-2xx response.
    async fn post(&self, url: &str, event: &str, payload: &serde_json::Value) -> AppResult<()>;
}

/// Body and metadata of a fetched remote resource
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Fetches a remote resource over HTTP.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Non-2xx responses are errors whose message carries the status code.
    async fn fetch(&self, url: &str) -> AppResult<FetchedResource>;
}

/// Best-effort cache for session lookups. Failures are reported but callers
/// must never fail a request because of them.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get(&self, session_id: Uuid) -> Result<Option<UploadSession>, String>;

    async fn set(&self, session: &UploadSession, ttl: Duration) -> Result<(), String>;

    async fn invalidate(&self, session_id: Uuid) -> Result<(), String>;
}

/// Cache that never stores anything
pub struct NoopSessionCache;

#[async_trait]
impl SessionCache for NoopSessionCache {
    async fn get(&self, _session_id: Uuid) -> Result<Option<UploadSession>, String> {
        Ok(None)
    }

    async fn set(&self, _session: &UploadSession, _ttl: Duration) -> Result<(), String> {
        Ok(())
    }

    async fn invalidate(&self, _session_id: Uuid) -> Result<(), String> {
        Ok(())
    }
}

/// In-process hook fired after a transaction that inserted outbox rows has
/// committed. Implementations must not block.
pub trait OutboxSignal: Send + Sync {
    fn message_committed(&self, message_id: Uuid);
}

/// Signal for deployments that rely on the sweeper alone
pub struct NoopOutboxSignal;

impl OutboxSignal for NoopOutboxSignal {
    fn message_committed(&self, _message_id: Uuid) {}
}
