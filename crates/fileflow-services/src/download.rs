//! Remote downloads: request, execute, retry
//!
//! A request stores a QUEUED task together with a Download outbox row; the
//! outbox handler turns that row into the first queue message. Each queue
//! message runs [`DownloadExecutionCoordinator::execute`] once. A failed
//! attempt is stored first, then a fresh queue message is published for the
//! next attempt while retries remain.
//!
//! An attempt left IN_PROGRESS longer than the staleness window (a worker died
//! mid-transfer) is taken over by the next delivery for the task, and it
//! uses up a retry like any other failed attempt.

use async_trait::async_trait;
use chrono::Utc;
use fileflow_core::models::{
    AssetOrigin, DownloadDestination, DownloadPayload, DownloadQueueMessage, DownloadStatus,
    DownloadTask, FailureDisposition, FileAsset, OutboxMessage, WebhookPayload,
};
use fileflow_core::{AppError, AppResult, HttpFetcher, OutboxSignal, QueuePublisher};
use fileflow_db::DownloadTaskStore;
use fileflow_infra::{QueueMessage, QueueMessageHandler};
use fileflow_storage::{download_object_key, ObjectStorageClient};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{signal_committed, storage_error};

pub const EVENT_DOWNLOAD_COMPLETED: &str = "download.completed";
pub const EVENT_DOWNLOAD_FAILED: &str = "download.failed";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_STALE_AFTER_SECS: i64 = 900;

#[derive(Debug, Clone)]
pub struct RequestDownload {
    pub tenant_id: Uuid,
    pub source_url: String,
    /// Defaults to the last path segment of the source url.
    pub file_name: Option<String>,
    pub callback_url: Option<String>,
}

pub struct DownloadTaskService {
    tasks: Arc<dyn DownloadTaskStore>,
    signal: Arc<dyn OutboxSignal>,
    bucket: String,
    max_retries: i32,
}

impl DownloadTaskService {
    pub fn new(
        tasks: Arc<dyn DownloadTaskStore>,
        signal: Arc<dyn OutboxSignal>,
        bucket: impl Into<String>,
        max_retries: i32,
    ) -> Self {
        Self {
            tasks,
            signal,
            bucket: bucket.into(),
            max_retries,
        }
    }

    #[tracing::instrument(skip(self, request), fields(tenant_id = %request.tenant_id))]
    pub async fn request_download(&self, request: RequestDownload) -> AppResult<DownloadTask> {
        validate_http_url(&request.source_url, "source url")?;
        if let Some(callback) = request.callback_url.as_deref() {
            validate_http_url(callback, "callback url")?;
        }
        let file_name = request
            .file_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| file_name_from_url(&request.source_url));

        let mut task = DownloadTask::new(
            request.tenant_id,
            request.source_url,
            DownloadDestination {
                bucket: self.bucket.clone(),
                key: String::new(),
            },
            self.max_retries,
            request.callback_url,
        );
        task.destination.key =
            download_object_key(task.tenant_id, task.id, &file_name).map_err(storage_error)?;

        let message = OutboxMessage::new(
            task.id,
            &DownloadPayload {
                task_id: task.id,
                tenant_id: task.tenant_id,
            },
        )
        .map_err(|e| AppError::Internal(format!("Failed to encode download payload: {}", e)))?;

        let outbox = [message];
        self.tasks.insert_task(&task, &outbox).await?;
        signal_committed(self.signal.as_ref(), &outbox);

        tracing::info!(task_id = %task.id, key = %task.destination.key, "Download requested");
        Ok(task)
    }

    pub async fn get_task(&self, tenant_id: Uuid, task_id: Uuid) -> AppResult<DownloadTask> {
        match self.tasks.find_task(task_id).await? {
            Some(task) if task.tenant_id == tenant_id => Ok(task),
            _ => Err(AppError::NotFound(format!("download task {}", task_id))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed { file_asset_id: Uuid },
    Failed {
        disposition: FailureDisposition,
        error: String,
        /// Whether the next attempt reached the queue. Only meaningful for
        /// `RetryScheduled`.
        retry_published: bool,
    },
    /// The task was not startable (duplicate delivery or already finished).
    Skipped { status: DownloadStatus },
}

pub struct DownloadExecutionCoordinator {
    tasks: Arc<dyn DownloadTaskStore>,
    storage: Arc<dyn ObjectStorageClient>,
    fetcher: Arc<dyn HttpFetcher>,
    publisher: Arc<dyn QueuePublisher>,
    signal: Arc<dyn OutboxSignal>,
    download_queue: String,
    stale_after: chrono::Duration,
}

impl DownloadExecutionCoordinator {
    pub fn new(
        tasks: Arc<dyn DownloadTaskStore>,
        storage: Arc<dyn ObjectStorageClient>,
        fetcher: Arc<dyn HttpFetcher>,
        publisher: Arc<dyn QueuePublisher>,
        signal: Arc<dyn OutboxSignal>,
        download_queue: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            storage,
            fetcher,
            publisher,
            signal,
            download_queue: download_queue.into(),
            stale_after: chrono::Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    /// How long an IN_PROGRESS attempt may run before another delivery may
    /// take the task over.
    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn execute(&self, task_id: Uuid) -> AppResult<DownloadOutcome> {
        let now = Utc::now();
        let stale_before = now - self.stale_after;
        let Some(mut task) = self.tasks.try_start(task_id, now, stale_before).await? else {
            let mut task = self
                .tasks
                .find_task(task_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("download task {}", task_id)))?;
            if task.is_stale(stale_before) {
                // Abandoned with no retry left to take it over.
                tracing::warn!(
                    retry_count = task.retry_count,
                    started_at = ?task.started_at,
                    "Download attempt abandoned mid-transfer"
                );
                let error = AppError::external("download", "attempt abandoned mid-transfer");
                return self.finish_failure(&mut task, error).await;
            }
            tracing::debug!(status = %task.status, "Download task not startable, skipping");
            return Ok(DownloadOutcome::Skipped {
                status: task.status,
            });
        };

        tracing::info!(attempt = task.retry_count, source_url = %task.source_url, "Download attempt started");

        match self.transfer(&task).await {
            Ok(asset) => self.finish_success(task, asset).await,
            Err(e) => {
                let error = e.normalize("download");
                self.finish_failure(&mut task, error).await
            }
        }
    }

    /// Fetch and store. Nothing here touches the task row.
    async fn transfer(&self, task: &DownloadTask) -> AppResult<FileAsset> {
        let start = std::time::Instant::now();
        let fetched = self.fetcher.fetch(&task.source_url).await?;
        if fetched.body.is_empty() {
            return Err(AppError::external("http", "empty body"));
        }

        let content_type = fetched
            .content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let size_bytes = fetched.body.len() as i64;

        let etag = self
            .storage
            .put_object(
                &task.destination.bucket,
                &task.destination.key,
                &content_type,
                fetched.body,
            )
            .await
            .map_err(storage_error)?;

        tracing::debug!(
            size_bytes = size_bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Remote resource stored"
        );

        Ok(FileAsset {
            id: Uuid::new_v4(),
            tenant_id: task.tenant_id,
            origin: AssetOrigin::Download,
            origin_id: task.id,
            bucket: task.destination.bucket.clone(),
            key: task.destination.key.clone(),
            content_type,
            size_bytes,
            etag: Some(etag),
            created_at: Utc::now(),
        })
    }

    async fn finish_success(
        &self,
        mut task: DownloadTask,
        asset: FileAsset,
    ) -> AppResult<DownloadOutcome> {
        task.complete(asset.id, Utc::now());

        let mut outbox = Vec::new();
        if let Some(url) = task.callback_url.as_deref() {
            outbox.push(webhook_message(
                &task,
                url,
                EVENT_DOWNLOAD_COMPLETED,
                json!({
                    "task_id": task.id,
                    "tenant_id": task.tenant_id,
                    "status": task.status,
                    "file_asset_id": asset.id,
                    "bucket": asset.bucket,
                    "key": asset.key,
                    "content_type": asset.content_type,
                    "size_bytes": asset.size_bytes,
                }),
            )?);
        }

        self.tasks.record_success(&task, &asset, &outbox).await?;
        signal_committed(self.signal.as_ref(), &outbox);

        tracing::info!(file_asset_id = %asset.id, size_bytes = asset.size_bytes, "Download completed");
        Ok(DownloadOutcome::Completed {
            file_asset_id: asset.id,
        })
    }

    async fn finish_failure(
        &self,
        task: &mut DownloadTask,
        error: AppError,
    ) -> AppResult<DownloadOutcome> {
        let message = error.to_string();
        let disposition = task.fail(message.clone(), Utc::now());

        let mut outbox = Vec::new();
        if disposition == FailureDisposition::Exhausted {
            if let Some(url) = task.callback_url.as_deref() {
                outbox.push(webhook_message(
                    task,
                    url,
                    EVENT_DOWNLOAD_FAILED,
                    json!({
                        "task_id": task.id,
                        "tenant_id": task.tenant_id,
                        "status": task.status,
                        "error": message,
                        "retry_count": task.retry_count,
                    }),
                )?);
            }
        }

        self.tasks.record_failure(task, &outbox).await?;
        signal_committed(self.signal.as_ref(), &outbox);

        let retry_published = match disposition {
            FailureDisposition::RetryScheduled => {
                let next = DownloadQueueMessage {
                    task_id: task.id,
                    tenant_id: task.tenant_id,
                    attempt: task.retry_count + 1,
                };
                let published = match serde_json::to_value(&next) {
                    Ok(body) => self.publisher.publish(&self.download_queue, &body).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode download retry message");
                        false
                    }
                };
                if published {
                    tracing::warn!(
                        error = %message,
                        retry_count = task.retry_count,
                        max_retries = task.max_retries,
                        "Download attempt failed, retry enqueued"
                    );
                } else {
                    tracing::error!(
                        error = %message,
                        retry_count = task.retry_count,
                        "Download attempt failed and the retry could not be enqueued, leaving the current message for redelivery"
                    );
                }
                published
            }
            FailureDisposition::Exhausted => {
                let exhausted = AppError::ExhaustedRetry {
                    entity: "download task",
                    id: task.id,
                    attempts: task.retry_count,
                    last_error: message.clone(),
                };
                tracing::error!(error = %exhausted, "Download permanently failed");
                false
            }
        };

        Ok(DownloadOutcome::Failed {
            disposition,
            error: message,
            retry_published,
        })
    }
}

fn webhook_message(
    task: &DownloadTask,
    url: &str,
    event: &str,
    body: serde_json::Value,
) -> AppResult<OutboxMessage> {
    OutboxMessage::new(
        task.id,
        &WebhookPayload {
            url: url.to_string(),
            event: event.to_string(),
            body,
        },
    )
    .map_err(|e| AppError::Internal(format!("Failed to encode webhook payload: {}", e)))
}

/// Consumes the download work queue.
pub struct DownloadQueueHandler {
    coordinator: Arc<DownloadExecutionCoordinator>,
}

impl DownloadQueueHandler {
    pub fn new(coordinator: Arc<DownloadExecutionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl QueueMessageHandler for DownloadQueueHandler {
    async fn handle(&self, message: &QueueMessage) -> AppResult<()> {
        let body: DownloadQueueMessage = serde_json::from_str(&message.body)?;
        match self.coordinator.execute(body.task_id).await {
            // Keep this message so its redelivery drives the owed retry.
            Ok(DownloadOutcome::Failed {
                disposition: FailureDisposition::RetryScheduled,
                retry_published: false,
                ..
            }) => Err(AppError::external(
                "queue",
                format!("retry for download task {} could not be enqueued", body.task_id),
            )),
            Ok(_) => Ok(()),
            // Unknown task: redelivery would not help.
            Err(AppError::NotFound(msg)) => {
                tracing::warn!(task_id = %body.task_id, "Dropping message for unknown task: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn validate_http_url(url: &str, what: &str) -> AppResult<()> {
    let lower = url.trim().to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(AppError::InvalidInput(format!(
            "{} must be an absolute http(s) url: {:?}",
            what, url
        ))),
    }
}

fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    after_scheme
        .split_once('/')
        .and_then(|(_, path)| path.rsplit('/').find(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| "download".to_string())
}
