//! Outbox handlers, one per outbox kind.

use async_trait::async_trait;
use fileflow_core::models::{
    DownloadPayload, DownloadQueueMessage, OutboxKind, OutboxMessage, WebhookPayload,
};
use fileflow_core::{AppError, AppResult, QueuePublisher, WebhookNotifier};
use fileflow_worker::{HandlerRegistry, OutboxHandler};
use std::sync::Arc;

/// Publishes the row's payload unchanged to a queue. Used for pipeline and
/// transform rows.
pub struct QueueForwardHandler {
    kind: OutboxKind,
    queue: String,
    publisher: Arc<dyn QueuePublisher>,
}

impl QueueForwardHandler {
    pub fn new(kind: OutboxKind, queue: impl Into<String>, publisher: Arc<dyn QueuePublisher>) -> Self {
        Self {
            kind,
            queue: queue.into(),
            publisher,
        }
    }
}

#[async_trait]
impl OutboxHandler for QueueForwardHandler {
    fn kind(&self) -> OutboxKind {
        self.kind
    }

    async fn handle(&self, message: &OutboxMessage) -> AppResult<()> {
        publish(self.publisher.as_ref(), &self.queue, &message.payload).await
    }
}

/// Turns a Download row into the first message on the download queue.
pub struct DownloadDispatchHandler {
    queue: String,
    publisher: Arc<dyn QueuePublisher>,
}

impl DownloadDispatchHandler {
    pub fn new(queue: impl Into<String>, publisher: Arc<dyn QueuePublisher>) -> Self {
        Self {
            queue: queue.into(),
            publisher,
        }
    }
}

#[async_trait]
impl OutboxHandler for DownloadDispatchHandler {
    fn kind(&self) -> OutboxKind {
        OutboxKind::Download
    }

    async fn handle(&self, message: &OutboxMessage) -> AppResult<()> {
        let payload: DownloadPayload = message.payload_as()?;
        let body = serde_json::to_value(DownloadQueueMessage {
            task_id: payload.task_id,
            tenant_id: payload.tenant_id,
            attempt: 0,
        })?;
        publish(self.publisher.as_ref(), &self.queue, &body).await
    }
}

pub struct WebhookDeliveryHandler {
    notifier: Arc<dyn WebhookNotifier>,
}

impl WebhookDeliveryHandler {
    pub fn new(notifier: Arc<dyn WebhookNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl OutboxHandler for WebhookDeliveryHandler {
    fn kind(&self) -> OutboxKind {
        OutboxKind::Webhook
    }

    async fn handle(&self, message: &OutboxMessage) -> AppResult<()> {
        let payload: WebhookPayload = message.payload_as()?;
        self.notifier
            .post(&payload.url, &payload.event, &payload.body)
            .await
    }
}

async fn publish(
    publisher: &dyn QueuePublisher,
    queue: &str,
    body: &serde_json::Value,
) -> AppResult<()> {
    if publisher.publish(queue, body).await {
        Ok(())
    } else {
        Err(AppError::external("queue", format!("publish to {} failed", queue)))
    }
}

/// Registry with a handler for every outbox kind.
pub fn register_outbox_handlers(
    publisher: Arc<dyn QueuePublisher>,
    notifier: Arc<dyn WebhookNotifier>,
    pipeline_queue: &str,
    transform_queue: &str,
    download_queue: &str,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(Arc::new(QueueForwardHandler::new(
            OutboxKind::Pipeline,
            pipeline_queue,
            publisher.clone(),
        )))
        .register(Arc::new(QueueForwardHandler::new(
            OutboxKind::Transform,
            transform_queue,
            publisher.clone(),
        )))
        .register(Arc::new(DownloadDispatchHandler::new(
            download_queue,
            publisher,
        )))
        .register(Arc::new(WebhookDeliveryHandler::new(notifier)))
}
