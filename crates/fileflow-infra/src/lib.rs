//! Fileflow infrastructure adapters
//!
//! Concrete implementations of the collaborator ports declared in
//! `fileflow-core`, plus telemetry setup and the retry/circuit breaker
//! primitives used around persistence calls.

pub mod cache;
#[cfg(feature = "http-fetch")]
pub mod fetcher;
pub mod queue;
pub mod resilience;
pub mod telemetry;
#[cfg(feature = "webhook")]
pub mod webhook;

pub use cache::LruSessionCache;
#[cfg(feature = "http-fetch")]
pub use fetcher::ReqwestHttpFetcher;
pub use queue::{QueueConsumerConfig, QueueMessage, QueueMessageHandler};
#[cfg(feature = "sqs")]
pub use queue::{sqs_client, SqsQueueConsumer, SqsQueuePublisher};
pub use resilience::{retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
pub use telemetry::{init_telemetry, shutdown_telemetry};
#[cfg(feature = "webhook")]
pub use webhook::{ReqwestWebhookNotifier, WebhookConfig};
