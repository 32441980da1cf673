//! Application setup and initialization
//!
//! Adapters first (database, object storage, SQS, HTTP), then the outbox
//! dispatcher, since every service needs it as its post-commit signal. The
//! sweepers and queue consumers start last.

pub mod database;
pub mod shutdown;

use anyhow::{Context, Result};
use fileflow_core::{Config, FileFlowConfig, OutboxSignal, QueuePublisher, SessionCache};
use fileflow_db::{DownloadTaskRepository, OutboxRepository, UploadSessionRepository};
use fileflow_infra::{
    sqs_client, CircuitBreakerConfig, LruSessionCache, QueueConsumerConfig, ReqwestHttpFetcher,
    ReqwestWebhookNotifier, RetryPolicy, SqsQueueConsumer, SqsQueuePublisher, WebhookConfig,
};
use fileflow_services::{
    register_outbox_handlers, DownloadExecutionCoordinator, DownloadQueueHandler,
    DownloadTaskService, ReconcilerConfig, SessionManager, SessionSettings, StorageEventReconciler,
    TransformRequestService,
};
use fileflow_storage::{ObjectStorageClient, S3ObjectStorage};
use fileflow_worker::{
    DispatcherConfig, OutboxDispatcher, OutboxExecutor, OutboxSweeper, PeriodicTask,
    SessionExpirationSweeper, SweeperConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// Running application. Services are exposed for embedding callers; the
/// background tasks stop on [`App::shutdown`].
pub struct App {
    pub sessions: Arc<SessionManager>,
    pub downloads: Arc<DownloadTaskService>,
    pub transforms: Arc<TransformRequestService>,
    dispatcher: Arc<OutboxDispatcher>,
    periodic: Vec<PeriodicTask>,
    consumers: Vec<SqsQueueConsumer>,
}

impl App {
    /// Stop taking new queue messages, stop the sweepers, then drain the
    /// dispatcher's in-flight rows.
    pub async fn shutdown(self) {
        for consumer in self.consumers {
            consumer.shutdown().await;
        }
        for task in self.periodic {
            task.shutdown().await;
        }
        self.dispatcher.shutdown().await;
        tracing::info!("Fileflow stopped");
    }
}

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<App> {
    fileflow_infra::init_telemetry(&config.settings().log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    tracing::info!(
        environment = %config.settings().environment,
        production = config.is_production(),
        "Configuration loaded and validated"
    );

    let settings = config.settings();
    let pool = database::setup_database(settings).await?;

    let storage: Arc<dyn ObjectStorageClient> = Arc::new(
        S3ObjectStorage::new(settings.s3_region.clone(), settings.s3_endpoint.clone())
            .await
            .context("Failed to initialize object storage")?,
    );
    let sqs = sqs_client(settings.s3_region.clone(), settings.sqs_endpoint.clone()).await;
    let publisher: Arc<dyn QueuePublisher> = Arc::new(SqsQueuePublisher::new(sqs.clone()));
    let notifier = Arc::new(ReqwestWebhookNotifier::new(WebhookConfig {
        timeout_seconds: settings.webhook_timeout_secs,
        signing_secret: settings.webhook_signing_secret.clone(),
    })?);
    let fetcher = Arc::new(ReqwestHttpFetcher::new(
        config.download_timeout(),
        settings.download_max_bytes,
    )?);
    let cache: Arc<dyn SessionCache> = Arc::new(LruSessionCache::new(settings.session_cache_capacity));

    let session_store = Arc::new(UploadSessionRepository::new(pool.clone()));
    let outbox_store = Arc::new(OutboxRepository::new(pool.clone()));
    let task_store = Arc::new(DownloadTaskRepository::new(pool));

    // Outbox engine
    let handlers = register_outbox_handlers(
        publisher.clone(),
        notifier,
        &settings.pipeline_queue,
        &settings.transform_queue,
        &settings.download_queue,
    );
    tracing::debug!(kinds = ?handlers.kinds(), "Outbox handlers registered");
    let executor = OutboxExecutor::new(outbox_store.clone(), handlers, settings.outbox_max_retries);
    let dispatcher = Arc::new(OutboxDispatcher::start(
        executor.clone(),
        DispatcherConfig {
            max_workers: settings.outbox_workers,
            channel_capacity: settings.outbox_channel_capacity,
        },
    ));
    let signal: Arc<dyn OutboxSignal> = dispatcher.clone();

    // Services
    let sessions = Arc::new(
        SessionManager::new(
            session_store.clone(),
            storage.clone(),
            signal.clone(),
            SessionSettings {
                bucket: settings.s3_bucket.clone(),
                session_ttl: config.session_ttl(),
                presigned_url_ttl: config.presigned_url_ttl(),
                cache_ttl: config.session_cache_ttl(),
                default_part_size: settings.multipart_part_size_bytes,
            },
        )
        .with_cache(cache.clone()),
    );
    let downloads = Arc::new(DownloadTaskService::new(
        task_store.clone(),
        signal.clone(),
        settings.s3_bucket.clone(),
        settings.download_max_retries,
    ));
    let transforms = Arc::new(TransformRequestService::new(
        task_store.clone(),
        outbox_store.clone(),
        signal.clone(),
    ));
    let coordinator = Arc::new(
        DownloadExecutionCoordinator::new(
            task_store,
            storage.clone(),
            fetcher,
            publisher,
            signal,
            settings.download_queue.clone(),
        )
        .with_stale_after(config.download_stale_after()),
    );

    // Periodic workers
    let sweeper = Arc::new(OutboxSweeper::new(
        outbox_store,
        executor,
        SweeperConfig {
            interval: config.outbox_sweep_interval(),
            pending_grace: chrono::Duration::seconds(settings.outbox_pending_grace_secs),
            processing_stale: chrono::Duration::seconds(settings.outbox_processing_stale_secs),
            batch_size: settings.outbox_sweep_batch_size,
        },
    ));
    let expiration = Arc::new(
        SessionExpirationSweeper::new(
            session_store,
            storage.clone(),
            settings.expiration_batch_size,
            config.expiration_sweep_interval(),
        )
        .with_cache(cache),
    );
    let periodic = vec![sweeper.spawn(), expiration.spawn()];

    // Queue consumers
    let mut consumers = vec![SqsQueueConsumer::spawn(
        sqs.clone(),
        consumer_config(settings, &settings.download_queue),
        Arc::new(DownloadQueueHandler::new(coordinator)),
    )];
    match settings.storage_event_queue.as_deref() {
        Some(queue) => {
            let reconciler = StorageEventReconciler::new(
                sessions.clone(),
                storage,
                reconciler_config(settings),
            );
            consumers.push(SqsQueueConsumer::spawn(
                sqs,
                consumer_config(settings, queue),
                Arc::new(reconciler),
            ));
        }
        None => tracing::warn!(
            "STORAGE_EVENT_QUEUE_URL not set, uploads complete only through the API"
        ),
    }

    tracing::info!(
        outbox_workers = settings.outbox_workers,
        consumers = consumers.len(),
        bucket = %settings.s3_bucket,
        "Fileflow started"
    );

    Ok(App {
        sessions,
        downloads,
        transforms,
        dispatcher,
        periodic,
        consumers,
    })
}

fn consumer_config(settings: &FileFlowConfig, queue: &str) -> QueueConsumerConfig {
    QueueConsumerConfig {
        max_messages: settings.queue_max_messages,
        wait_time_secs: settings.queue_wait_time_secs,
        visibility_timeout_secs: settings.queue_visibility_timeout_secs,
        ..QueueConsumerConfig::new(queue)
    }
}

fn reconciler_config(settings: &FileFlowConfig) -> ReconcilerConfig {
    ReconcilerConfig {
        retry: RetryPolicy {
            max_attempts: settings.reconciler_max_attempts,
            initial_backoff: Duration::from_millis(settings.reconciler_initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.reconciler_max_backoff_ms),
            multiplier: settings.reconciler_backoff_multiplier,
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: settings.reconciler_breaker_threshold,
            open_duration: Duration::from_secs(settings.reconciler_breaker_open_secs),
        },
    }
}
