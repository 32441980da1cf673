//! Test helpers: in-process fakes for storage, queue, webhooks and HTTP, plus
//! wiring for the services over `InMemoryStore`.
//!
//! Each test binary uses a different subset of these.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fileflow_core::models::{CompletedPart, OutboxMessage, UploadSession};
use fileflow_core::{
    AppError, AppResult, FetchedResource, HttpFetcher, NoopOutboxSignal, QueuePublisher,
    WebhookNotifier,
};
use fileflow_db::{InMemoryStore, SessionStore};
use fileflow_services::{SessionManager, SessionSettings};
use fileflow_storage::{ObjectMetadata, ObjectStorageClient, StorageError, StorageResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const BUCKET: &str = "b";

pub fn settings() -> SessionSettings {
    SessionSettings {
        bucket: BUCKET.to_string(),
        session_ttl: chrono::Duration::hours(1),
        presigned_url_ttl: Duration::from_secs(900),
        cache_ttl: Duration::from_secs(60),
        default_part_size: 5 * 1024 * 1024,
    }
}

pub fn session_manager(store: Arc<dyn SessionStore>, storage: Arc<FakeStorage>) -> SessionManager {
    SessionManager::new(store, storage, Arc::new(NoopOutboxSignal), settings())
}

/// Object storage double. Objects written through `put_object` or
/// `complete_multipart_upload` are visible to `head_object`.
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, ObjectMetadata>>,
    pub aborted: Mutex<Vec<String>>,
    pub fail_init: AtomicBool,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend a client uploaded `key` directly.
    pub async fn put_uploaded(&self, key: &str, etag: &str, size: i64) {
        self.objects.lock().await.insert(
            key.to_string(),
            ObjectMetadata {
                size,
                etag: etag.to_string(),
                content_type: None,
            },
        );
    }

    pub async fn object(&self, key: &str) -> Option<ObjectMetadata> {
        self.objects.lock().await.get(key).cloned()
    }

    fn init_allowed(&self) -> StorageResult<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageClient for FakeStorage {
    async fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        _ttl: Duration,
    ) -> StorageResult<String> {
        self.init_allowed()?;
        Ok(format!("https://storage.test/{}/{}?sig=1", bucket, key))
    }

    async fn initiate_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        self.init_allowed()?;
        Ok(format!("upload-{}", key.len()))
    }

    async fn generate_presigned_part_url(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        _ttl: Duration,
    ) -> StorageResult<String> {
        Ok(format!(
            "https://storage.test/{}/{}?uploadId={}&partNumber={}",
            bucket, key, upload_id, part_number
        ))
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        _upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String> {
        let etag = format!("multi-{}", parts.len());
        self.objects.lock().await.insert(
            key.to_string(),
            ObjectMetadata {
                size: parts.iter().map(|p| p.size).sum(),
                etag: etag.clone(),
                content_type: None,
            },
        );
        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        self.aborted.lock().await.push(upload_id.to_string());
        Ok(())
    }

    async fn head_object(&self, _bucket: &str, key: &str) -> StorageResult<Option<ObjectMetadata>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn put_object(
        &self,
        _bucket: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> StorageResult<String> {
        let etag = format!("put-{}", data.len());
        self.objects.lock().await.insert(
            key.to_string(),
            ObjectMetadata {
                size: data.len() as i64,
                etag: etag.clone(),
                content_type: Some(content_type.to_string()),
            },
        );
        Ok(etag)
    }
}

/// Records every publish and webhook post. While `reject` is set, publishes
/// fail and are not recorded.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, serde_json::Value)>>,
    pub posted: Mutex<Vec<(String, String, serde_json::Value)>>,
    pub reject: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn published_to(&self, queue: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    async fn publish(&self, queue: &str, message: &serde_json::Value) -> bool {
        if self.reject.load(Ordering::SeqCst) {
            return false;
        }
        self.published
            .lock()
            .await
            .push((queue.to_string(), message.clone()));
        true
    }
}

#[async_trait]
impl WebhookNotifier for RecordingPublisher {
    async fn post(&self, url: &str, event: &str, payload: &serde_json::Value) -> AppResult<()> {
        self.posted
            .lock()
            .await
            .push((url.to_string(), event.to_string(), payload.clone()));
        Ok(())
    }
}

/// Replays a fixed script of responses, then keeps failing.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<AppResult<FetchedResource>>>,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<AppResult<FetchedResource>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(times: usize) -> Arc<Self> {
        Self::new(
            (0..times)
                .map(|_| Err(AppError::external("http", "HTTP 503 from source")))
                .collect(),
        )
    }

    pub fn ok(body: &'static [u8], content_type: &str) -> AppResult<FetchedResource> {
        Ok(FetchedResource {
            content_type: Some(content_type.to_string()),
            body: Bytes::from_static(body),
        })
    }
}

#[async_trait]
impl HttpFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> AppResult<FetchedResource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(AppError::external("http", "script exhausted")))
    }
}

/// Session store whose next `fail_saves` writes fail with a transient error.
pub struct FlakySessionStore {
    inner: InMemoryStore,
    fail_saves: AtomicUsize,
    pub save_calls: AtomicUsize,
}

impl FlakySessionStore {
    pub fn new(inner: InMemoryStore, fail_saves: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_saves: AtomicUsize::new(fail_saves),
            save_calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for FlakySessionStore {
    async fn insert_session(&self, session: &UploadSession) -> AppResult<()> {
        self.inner.insert_session(session).await
    }

    async fn find_session(&self, session_id: Uuid) -> AppResult<Option<UploadSession>> {
        self.inner.find_session(session_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<UploadSession>> {
        self.inner
            .find_by_idempotency_key(tenant_id, idempotency_key)
            .await
    }

    async fn save_session(
        &self,
        session: &UploadSession,
        outbox: &[OutboxMessage],
    ) -> AppResult<UploadSession> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::external("database", "connection reset"));
        }
        self.inner.save_session(session, outbox).await
    }

    async fn find_expirable(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<UploadSession>> {
        self.inner.find_expirable(now, limit).await
    }
}

/// S3 notification body for a single created object.
pub fn object_created_event(key: &str, etag: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventVersion": "2.1",
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": {"name": BUCKET},
                "object": {"key": key, "size": 3, "eTag": etag}
            }
        }]
    })
    .to_string()
}
