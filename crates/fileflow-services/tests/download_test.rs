//! Download request, execution and retry against the in-memory store.

mod helpers;

use chrono::Utc;
use fileflow_core::models::{
    DownloadQueueMessage, DownloadStatus, FailureDisposition, OutboxKind, OutboxStatus,
    WebhookPayload,
};
use fileflow_core::{AppError, NoopOutboxSignal};
use fileflow_db::{DownloadTaskStore, InMemoryStore};
use fileflow_infra::{QueueMessage, QueueMessageHandler};
use fileflow_services::download::{EVENT_DOWNLOAD_COMPLETED, EVENT_DOWNLOAD_FAILED};
use fileflow_services::{
    register_outbox_handlers, DownloadExecutionCoordinator, DownloadOutcome, DownloadQueueHandler,
    DownloadTaskService, RequestDownload,
};
use fileflow_worker::{ExecutionOutcome, OutboxExecutor};
use helpers::{FakeStorage, RecordingPublisher, ScriptedFetcher, BUCKET};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

const DOWNLOAD_QUEUE: &str = "downloads";

struct Harness {
    store: InMemoryStore,
    storage: Arc<FakeStorage>,
    publisher: Arc<RecordingPublisher>,
    service: DownloadTaskService,
    coordinator: Arc<DownloadExecutionCoordinator>,
}

fn harness(fetcher: Arc<ScriptedFetcher>, max_retries: i32) -> Harness {
    let store = InMemoryStore::new();
    let storage = FakeStorage::new();
    let publisher = RecordingPublisher::new();
    let service = DownloadTaskService::new(
        Arc::new(store.clone()),
        Arc::new(NoopOutboxSignal),
        BUCKET,
        max_retries,
    );
    let coordinator = Arc::new(DownloadExecutionCoordinator::new(
        Arc::new(store.clone()),
        storage.clone(),
        fetcher,
        publisher.clone(),
        Arc::new(NoopOutboxSignal),
        DOWNLOAD_QUEUE,
    ));
    Harness {
        store,
        storage,
        publisher,
        service,
        coordinator,
    }
}

fn request(tenant_id: Uuid, callback: Option<&str>) -> RequestDownload {
    RequestDownload {
        tenant_id,
        source_url: "https://cdn.example.com/images/cat.png".to_string(),
        file_name: None,
        callback_url: callback.map(str::to_string),
    }
}

#[tokio::test]
async fn test_four_failures_with_three_retries_publish_exactly_three_retries() {
    let fetcher = ScriptedFetcher::failing(4);
    let h = harness(fetcher.clone(), 3);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), Some("https://hooks.example.com/d")))
        .await
        .unwrap();

    let mut dispositions = Vec::new();
    for _ in 0..4 {
        match h.coordinator.execute(task.id).await.unwrap() {
            DownloadOutcome::Failed { disposition, .. } => dispositions.push(disposition),
            other => panic!("expected a failed attempt, got {other:?}"),
        }
    }

    assert_eq!(
        dispositions,
        vec![
            FailureDisposition::RetryScheduled,
            FailureDisposition::RetryScheduled,
            FailureDisposition::RetryScheduled,
            FailureDisposition::Exhausted,
        ]
    );
    let retries = h.publisher.published_to(DOWNLOAD_QUEUE).await;
    assert_eq!(retries.len(), 3);
    let attempts: Vec<i32> = retries
        .iter()
        .map(|body| serde_json::from_value::<DownloadQueueMessage>(body.clone()).unwrap().attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let stored = h.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert!(stored.is_terminal());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);

    // A fifth delivery finds nothing to do.
    assert_eq!(
        h.coordinator.execute(task.id).await.unwrap(),
        DownloadOutcome::Skipped {
            status: DownloadStatus::Failed
        }
    );

    let webhooks: Vec<WebhookPayload> = h
        .store
        .outbox_for(task.id)
        .await
        .into_iter()
        .filter(|m| m.kind == OutboxKind::Webhook)
        .map(|m| m.payload_as().unwrap())
        .collect();
    assert_eq!(webhooks.len(), 1);
    assert_eq!(webhooks[0].event, EVENT_DOWNLOAD_FAILED);
}

#[tokio::test]
async fn test_successful_download_stores_asset_and_queues_webhook() {
    let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::ok(b"png-bytes", "image/png; q=1")]);
    let h = harness(fetcher, 3);
    let tenant_id = Uuid::new_v4();
    let task = h
        .service
        .request_download(request(tenant_id, Some("https://hooks.example.com/d")))
        .await
        .unwrap();
    assert!(task.destination.key.ends_with("/cat.png"));

    let outcome = h.coordinator.execute(task.id).await.unwrap();
    let DownloadOutcome::Completed { file_asset_id } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    let stored = h.service.get_task(tenant_id, task.id).await.unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    assert_eq!(stored.file_asset_id, Some(file_asset_id));

    let asset = h.store.find_file_asset(file_asset_id).await.unwrap().unwrap();
    assert_eq!(asset.content_type, "image/png");
    assert_eq!(asset.size_bytes, 9);
    assert!(h.storage.object(&asset.key).await.is_some());

    let webhook: WebhookPayload = h
        .store
        .outbox_for(task.id)
        .await
        .into_iter()
        .find(|m| m.kind == OutboxKind::Webhook)
        .expect("webhook row")
        .payload_as()
        .unwrap();
    assert_eq!(webhook.event, EVENT_DOWNLOAD_COMPLETED);
    assert_eq!(webhook.body["file_asset_id"], serde_json::json!(file_asset_id));
}

#[tokio::test]
async fn test_empty_body_counts_as_a_failed_attempt() {
    let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::ok(b"", "text/plain")]);
    let h = harness(fetcher, 1);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), None))
        .await
        .unwrap();

    let outcome = h.coordinator.execute(task.id).await.unwrap();
    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            disposition: FailureDisposition::RetryScheduled,
            retry_published: true,
            ..
        }
    ));
    assert!(h.store.file_assets().await.is_empty());
}

#[tokio::test]
async fn test_request_to_webhook_round_trip() {
    let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::ok(b"hello", "text/plain")]);
    let h = harness(fetcher, 3);
    let executor = OutboxExecutor::new(
        Arc::new(h.store.clone()),
        register_outbox_handlers(
            h.publisher.clone(),
            h.publisher.clone(),
            "pipeline",
            "transforms",
            DOWNLOAD_QUEUE,
        ),
        5,
    );

    let task = h
        .service
        .request_download(request(Uuid::new_v4(), Some("https://hooks.example.com/d")))
        .await
        .unwrap();

    // Download outbox row -> first queue message.
    let row = h.store.outbox_for(task.id).await.remove(0);
    assert_eq!(row.kind, OutboxKind::Download);
    assert_eq!(
        executor.claim_and_execute(row.id).await.unwrap(),
        ExecutionOutcome::Processed
    );
    let messages = h.publisher.published_to(DOWNLOAD_QUEUE).await;
    assert_eq!(messages.len(), 1);

    // Queue message -> execution.
    let consumer = DownloadQueueHandler::new(h.coordinator.clone());
    consumer
        .handle(&QueueMessage {
            id: Some("m-1".to_string()),
            receipt_handle: "r-1".to_string(),
            body: messages[0].to_string(),
        })
        .await
        .unwrap();

    // Webhook outbox row -> notifier.
    let webhook_row = h
        .store
        .outbox_for(task.id)
        .await
        .into_iter()
        .find(|m| m.kind == OutboxKind::Webhook)
        .expect("webhook row");
    executor.claim_and_execute(webhook_row.id).await.unwrap();

    let posted = h.publisher.posted.lock().await;
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "https://hooks.example.com/d");
    assert_eq!(posted[0].1, EVENT_DOWNLOAD_COMPLETED);
    drop(posted);

    assert!(h
        .store
        .outbox_messages()
        .await
        .iter()
        .all(|m| m.status == OutboxStatus::Processed));
}

#[tokio::test]
async fn test_concurrent_deliveries_run_the_download_once() {
    let fetcher = ScriptedFetcher::new(vec![
        ScriptedFetcher::ok(b"a", "text/plain"),
        ScriptedFetcher::ok(b"b", "text/plain"),
    ]);
    let h = harness(fetcher.clone(), 3);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), None))
        .await
        .unwrap();

    let (a, b) = tokio::join!(h.coordinator.execute(task.id), h.coordinator.execute(task.id));
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, DownloadOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.file_assets().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_task_message_is_acknowledged() {
    let h = harness(ScriptedFetcher::failing(0), 3);
    let consumer = DownloadQueueHandler::new(h.coordinator.clone());
    let body = serde_json::to_string(&DownloadQueueMessage {
        task_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        attempt: 0,
    })
    .unwrap();

    let result = consumer
        .handle(&QueueMessage {
            id: None,
            receipt_handle: "r".to_string(),
            body,
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_non_http_source_is_rejected() {
    let h = harness(ScriptedFetcher::failing(0), 3);
    let mut bad = request(Uuid::new_v4(), None);
    bad.source_url = "file:///etc/passwd".to_string();

    let err = h.service.request_download(bad).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(h.store.outbox_messages().await.is_empty());
}

fn queue_message(task: &fileflow_core::models::DownloadTask) -> QueueMessage {
    QueueMessage {
        id: Some("m-1".to_string()),
        receipt_handle: "r-1".to_string(),
        body: serde_json::to_string(&DownloadQueueMessage {
            task_id: task.id,
            tenant_id: task.tenant_id,
            attempt: 0,
        })
        .unwrap(),
    }
}

#[tokio::test]
async fn test_unpublished_retry_keeps_the_message_for_redelivery() {
    let fetcher = ScriptedFetcher::new(vec![
        Err(AppError::external("http", "HTTP 503 from source")),
        ScriptedFetcher::ok(b"late", "text/plain"),
    ]);
    let h = harness(fetcher.clone(), 3);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), None))
        .await
        .unwrap();
    let consumer = DownloadQueueHandler::new(h.coordinator.clone());
    let message = queue_message(&task);

    h.publisher.reject.store(true, Ordering::SeqCst);
    let err = consumer.handle(&message).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::ExternalDependency {
            dependency: "queue",
            ..
        }
    ));
    assert!(h.publisher.published_to(DOWNLOAD_QUEUE).await.is_empty());

    let stored = h.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Failed);
    assert_eq!(stored.retry_count, 0);
    assert!(!stored.is_terminal());

    // The redelivered message runs the owed retry.
    h.publisher.reject.store(false, Ordering::SeqCst);
    consumer.handle(&message).await.unwrap();

    let stored = h.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_abandoned_attempt_is_taken_over_by_redelivery() {
    let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::ok(b"again", "text/plain")]);
    let h = harness(fetcher.clone(), 3);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), None))
        .await
        .unwrap();

    // A worker started the task an hour ago and never recorded an outcome.
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    h.store
        .try_start(task.id, an_hour_ago, an_hour_ago)
        .await
        .unwrap()
        .unwrap();

    DownloadQueueHandler::new(h.coordinator.clone())
        .handle(&queue_message(&task))
        .await
        .unwrap();

    let stored = h.store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_running_attempt_inside_window_is_left_alone() {
    let fetcher = ScriptedFetcher::failing(0);
    let h = harness(fetcher.clone(), 3);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), None))
        .await
        .unwrap();
    let now = Utc::now();
    h.store.try_start(task.id, now, now).await.unwrap().unwrap();

    assert_eq!(
        h.coordinator.execute(task.id).await.unwrap(),
        DownloadOutcome::Skipped {
            status: DownloadStatus::InProgress
        }
    );
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_abandoned_attempt_without_retries_fails_for_good() {
    let fetcher = ScriptedFetcher::failing(0);
    let h = harness(fetcher.clone(), 0);
    let task = h
        .service
        .request_download(request(Uuid::new_v4(), Some("https://hooks.example.com/d")))
        .await
        .unwrap();
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    h.store
        .try_start(task.id, an_hour_ago, an_hour_ago)
        .await
        .unwrap()
        .unwrap();

    let outcome = h.coordinator.execute(task.id).await.unwrap();
    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            disposition: FailureDisposition::Exhausted,
            ..
        }
    ));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

    let stored = h.store.find_task(task.id).await.unwrap().unwrap();
    assert!(stored.is_terminal());
    let failure_hooks = h
        .store
        .outbox_for(task.id)
        .await
        .into_iter()
        .filter(|m| m.kind == OutboxKind::Webhook)
        .count();
    assert_eq!(failure_hooks, 1);
}
