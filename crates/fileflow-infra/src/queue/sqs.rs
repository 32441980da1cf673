use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use fileflow_core::{AppError, AppResult, ErrorMetadata, LogLevel, QueuePublisher};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{clamp_receive_settings, QueueConsumerConfig, QueueMessage, QueueMessageHandler};

/// Build an SQS client from the ambient AWS configuration.
pub async fn sqs_client(region: Option<String>, endpoint_url: Option<String>) -> Client {
    let region_provider = RegionProviderChain::first_try(region.map(aws_config::Region::new))
        .or_default_provider()
        .or_else("us-east-1");

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    match endpoint_url {
        Some(endpoint) => {
            let sqs_config = aws_sdk_sqs::config::Builder::from(&config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(sqs_config)
        }
        None => Client::new(&config),
    }
}

/// Queue names are resolved to urls once and cached; full urls pass through.
#[derive(Clone)]
struct QueueUrlResolver {
    client: Client,
    urls: Arc<Mutex<HashMap<String, String>>>,
}

impl QueueUrlResolver {
    fn new(client: Client) -> Self {
        Self {
            client,
            urls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn resolve(&self, queue: &str) -> AppResult<String> {
        if queue.starts_with("https://") || queue.starts_with("http://") {
            return Ok(queue.to_string());
        }
        if let Some(url) = self.urls.lock().await.get(queue) {
            return Ok(url.clone());
        }

        let output = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| AppError::external("sqs", format!("Failed to resolve queue {}: {}", queue, e)))?;
        let url = output
            .queue_url()
            .ok_or_else(|| AppError::external("sqs", format!("No url returned for queue {}", queue)))?
            .to_string();

        self.urls.lock().await.insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[derive(Clone)]
pub struct SqsQueuePublisher {
    client: Client,
    resolver: QueueUrlResolver,
}

impl SqsQueuePublisher {
    pub fn new(client: Client) -> Self {
        Self {
            resolver: QueueUrlResolver::new(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl QueuePublisher for SqsQueuePublisher {
    #[tracing::instrument(skip(self, message), fields(queue = %queue))]
    async fn publish(&self, queue: &str, message: &serde_json::Value) -> bool {
        let queue_url = match self.resolver.resolve(queue).await {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "Failed to publish message");
                return false;
            }
        };

        let body = message.to_string();
        match self
            .client
            .send_message()
            .queue_url(&queue_url)
            .message_body(body)
            .send()
            .await
        {
            Ok(output) => {
                tracing::debug!(
                    message_id = output.message_id().unwrap_or_default(),
                    "Message published"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to publish message");
                false
            }
        }
    }
}

/// Long-polling consumer loop
///
/// Messages of one batch are handled concurrently. A message is deleted only
/// after its handler succeeds; failures are left for redelivery.
pub struct SqsQueueConsumer {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SqsQueueConsumer {
    pub fn spawn(
        client: Client,
        config: QueueConsumerConfig,
        handler: Arc<dyn QueueMessageHandler>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Self::run(client, config, handler, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop polling and wait for the batch in flight to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Queue consumer task panicked");
        }
    }

    async fn run(
        client: Client,
        config: QueueConsumerConfig,
        handler: Arc<dyn QueueMessageHandler>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let resolver = QueueUrlResolver::new(client.clone());
        let (max_messages, wait_time_secs) = clamp_receive_settings(&config);

        tracing::info!(
            queue = %config.queue,
            max_messages = max_messages,
            wait_time_secs = wait_time_secs,
            "Queue consumer started"
        );

        loop {
            let queue_url = tokio::select! {
                _ = shutdown_rx.recv() => break,
                resolved = resolver.resolve(&config.queue) => match resolved {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::warn!(error = %e, "Queue url lookup failed, will retry");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                },
            };

            let received = tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = client
                    .receive_message()
                    .queue_url(&queue_url)
                    .max_number_of_messages(max_messages)
                    .wait_time_seconds(wait_time_secs)
                    .visibility_timeout(config.visibility_timeout_secs)
                    .send() => received,
            };

            let output = match received {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(error = %e, queue = %config.queue, "Receive failed, will retry");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let messages: Vec<QueueMessage> = output
                .messages()
                .iter()
                .filter_map(|m| {
                    Some(QueueMessage {
                        id: m.message_id().map(str::to_string),
                        receipt_handle: m.receipt_handle()?.to_string(),
                        body: m.body().unwrap_or_default().to_string(),
                    })
                })
                .collect();

            if messages.is_empty() {
                continue;
            }
            tracing::debug!(count = messages.len(), queue = %config.queue, "Received messages");

            join_all(
                messages
                    .iter()
                    .map(|message| Self::process(&client, &queue_url, handler.as_ref(), message)),
            )
            .await;
        }

        tracing::info!(queue = %config.queue, "Queue consumer stopped");
    }

    async fn process(
        client: &Client,
        queue_url: &str,
        handler: &dyn QueueMessageHandler,
        message: &QueueMessage,
    ) {
        match handler.handle(message).await {
            Ok(()) => {
                if let Err(e) = client
                    .delete_message()
                    .queue_url(queue_url)
                    .receipt_handle(&message.receipt_handle)
                    .send()
                    .await
                {
                    tracing::warn!(
                        error = %e,
                        message_id = ?message.id,
                        "Failed to delete handled message; it will be redelivered"
                    );
                }
            }
            Err(e) => match e.log_level() {
                LogLevel::Error => tracing::error!(
                    error = %e.detailed_message(),
                    error_type = e.error_type(),
                    message_id = ?message.id,
                    "Queue message handler failed; leaving message for redelivery"
                ),
                LogLevel::Warn => tracing::warn!(
                    error = %e,
                    error_type = e.error_type(),
                    message_id = ?message.id,
                    "Queue message handler failed; leaving message for redelivery"
                ),
                LogLevel::Debug => tracing::debug!(
                    error = %e,
                    error_type = e.error_type(),
                    message_id = ?message.id,
                    "Queue message rejected; leaving message for redelivery"
                ),
            },
        }
    }
}
