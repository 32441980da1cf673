//! Work queue adapters
//!
//! The publisher side implements `fileflow_core::QueuePublisher`. The consumer
//! side long-polls a queue and hands each body to a [`QueueMessageHandler`],
//! deleting the message only once the handler returns `Ok`.

use async_trait::async_trait;
use fileflow_core::AppResult;

#[cfg(feature = "sqs")]
mod sqs;

#[cfg(feature = "sqs")]
pub use sqs::{sqs_client, SqsQueueConsumer, SqsQueuePublisher};

/// A message received from a work queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: Option<String>,
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait QueueMessageHandler: Send + Sync {
    /// An error leaves the message on the queue; it becomes visible again
    /// after the visibility timeout.
    async fn handle(&self, message: &QueueMessage) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    /// Queue name or full queue url
    pub queue: String,
    pub max_messages: i32,
    pub wait_time_secs: i32,
    pub visibility_timeout_secs: i32,
}

impl QueueConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_messages: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        }
    }
}

/// SQS only accepts 1..=10 messages per receive and 0..=20 seconds of wait.
pub(crate) fn clamp_receive_settings(config: &QueueConsumerConfig) -> (i32, i32) {
    (
        config.max_messages.clamp(1, 10),
        config.wait_time_secs.clamp(0, 20),
    )
}
