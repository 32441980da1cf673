//! Upload session flows against the in-memory store.

mod helpers;

use fileflow_core::models::{
    AccessType, OutboxKind, OutboxStatus, PipelinePayload, SessionStatus, UploadSession,
};
use fileflow_core::{AppError, SessionError};
use fileflow_db::InMemoryStore;
use fileflow_services::session_manager::MIN_PART_SIZE;
use fileflow_services::{InitMultipartUpload, InitSingleUpload};
use helpers::{session_manager, FakeStorage, BUCKET};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn single(tenant_id: Uuid, idempotency_key: &str) -> InitSingleUpload {
    InitSingleUpload {
        tenant_id,
        file_name: "report.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        access_type: AccessType::Private,
        idempotency_key: idempotency_key.to_string(),
        expected_checksum: None,
    }
}

fn multipart(tenant_id: Uuid, parts: i64) -> InitMultipartUpload {
    InitMultipartUpload {
        tenant_id,
        file_name: "video.mp4".to_string(),
        content_type: "video/mp4".to_string(),
        access_type: AccessType::Public,
        file_size: parts * MIN_PART_SIZE,
        part_size: Some(MIN_PART_SIZE),
        idempotency_key: None,
    }
}

#[tokio::test]
async fn test_single_upload_completion_writes_one_pending_outbox_row() {
    let store = InMemoryStore::new();
    let manager = session_manager(Arc::new(store.clone()), FakeStorage::new());
    let tenant_id = Uuid::new_v4();

    let session = manager.init_single(single(tenant_id, "k")).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Active);
    assert_eq!(session.target().bucket, BUCKET);

    let completed = manager
        .complete(tenant_id, session.id(), Some("abc".to_string()))
        .await
        .unwrap();
    assert_eq!(completed.status(), SessionStatus::Completed);
    assert_eq!(completed.etag(), Some("abc"));

    let outbox = store.outbox_for(session.id()).await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].status, OutboxStatus::Pending);
    assert_eq!(outbox[0].kind, OutboxKind::Pipeline);
    let payload: PipelinePayload = outbox[0].payload_as().unwrap();
    assert_eq!(payload.session_id, session.id());
    assert_eq!(payload.etag.as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_completing_twice_is_rejected_without_a_second_outbox_row() {
    let store = InMemoryStore::new();
    let manager = session_manager(Arc::new(store.clone()), FakeStorage::new());
    let tenant_id = Uuid::new_v4();
    let session = manager.init_single(single(tenant_id, "k")).await.unwrap();

    manager
        .complete(tenant_id, session.id(), Some("abc".to_string()))
        .await
        .unwrap();
    let err = manager
        .complete(tenant_id, session.id(), Some("abc".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Session(SessionError::InvalidTransition { .. })
    ));
    assert_eq!(store.outbox_for(session.id()).await.len(), 1);
}

#[tokio::test]
async fn test_multipart_completes_only_with_every_part() {
    let store = InMemoryStore::new();
    let storage = FakeStorage::new();
    let manager = session_manager(Arc::new(store.clone()), storage.clone());
    let tenant_id = Uuid::new_v4();

    let complete_session = manager.init_multipart(multipart(tenant_id, 3)).await.unwrap();
    let partial_session = manager.init_multipart(multipart(tenant_id, 3)).await.unwrap();
    let UploadSession::Multipart(m) = &complete_session else {
        panic!("expected a multipart session");
    };
    assert_eq!(m.total_parts, 3);

    for part in 1..=3 {
        manager
            .mark_part_uploaded(tenant_id, complete_session.id(), part, format!("e{part}"), MIN_PART_SIZE)
            .await
            .unwrap();
    }
    for part in 1..=2 {
        manager
            .mark_part_uploaded(tenant_id, partial_session.id(), part, format!("e{part}"), MIN_PART_SIZE)
            .await
            .unwrap();
    }

    let done = manager
        .complete(tenant_id, complete_session.id(), None)
        .await
        .unwrap();
    assert_eq!(done.status(), SessionStatus::Completed);
    assert_eq!(done.etag(), Some("multi-3"));
    assert!(storage.object(&done.target().key).await.is_some());

    let err = manager
        .complete(tenant_id, partial_session.id(), None)
        .await
        .unwrap_err();
    match err {
        AppError::Session(SessionError::MissingParts { missing, .. }) => assert_eq!(missing, vec![3]),
        other => panic!("expected missing parts, got {other:?}"),
    }
    assert!(store.outbox_for(partial_session.id()).await.is_empty());
}

#[tokio::test]
async fn test_first_part_moves_session_in_progress() {
    let manager = session_manager(Arc::new(InMemoryStore::new()), FakeStorage::new());
    let tenant_id = Uuid::new_v4();
    let session = manager.init_multipart(multipart(tenant_id, 2)).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Active);

    let url = manager.part_upload_url(tenant_id, session.id(), 2).await.unwrap();
    assert!(url.contains("partNumber=2"));
    assert!(manager.part_upload_url(tenant_id, session.id(), 3).await.is_err());

    let updated = manager
        .mark_part_uploaded(tenant_id, session.id(), 1, "e1".to_string(), MIN_PART_SIZE)
        .await
        .unwrap();
    assert_eq!(updated.status(), SessionStatus::InProgress);
}

#[tokio::test]
async fn test_init_is_idempotent_per_tenant_and_key() {
    let store = InMemoryStore::new();
    let manager = session_manager(Arc::new(store.clone()), FakeStorage::new());
    let tenant_id = Uuid::new_v4();

    let first = manager.init_single(single(tenant_id, "same")).await.unwrap();
    let again = manager.init_single(single(tenant_id, "same")).await.unwrap();
    let other_tenant = manager
        .init_single(single(Uuid::new_v4(), "same"))
        .await
        .unwrap();

    assert_eq!(first.id(), again.id());
    assert_ne!(first.id(), other_tenant.id());
    assert_eq!(store.session_count().await, 2);
}

#[tokio::test]
async fn test_concurrent_inits_with_one_key_create_one_session() {
    let store = InMemoryStore::new();
    let manager = Arc::new(session_manager(Arc::new(store.clone()), FakeStorage::new()));
    let tenant_id = Uuid::new_v4();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.init_single(single(tenant_id, "race")).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.session_count().await, 1);
}

#[tokio::test]
async fn test_storage_failure_leaves_failed_session() {
    let store = InMemoryStore::new();
    let storage = FakeStorage::new();
    storage.fail_init.store(true, Ordering::SeqCst);
    let manager = session_manager(Arc::new(store.clone()), storage);
    let tenant_id = Uuid::new_v4();

    let err = manager.init_single(single(tenant_id, "k")).await.unwrap_err();
    assert!(matches!(err, AppError::ExternalDependency { .. }));

    let session = fileflow_db::SessionStore::find_by_idempotency_key(&store, tenant_id, "k")
        .await
        .unwrap()
        .expect("session row kept");
    assert_eq!(session.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn test_cancel_aborts_provider_upload() {
    let storage = FakeStorage::new();
    let manager = session_manager(Arc::new(InMemoryStore::new()), storage.clone());
    let tenant_id = Uuid::new_v4();
    let session = manager.init_multipart(multipart(tenant_id, 2)).await.unwrap();

    let cancelled = manager.cancel(tenant_id, session.id()).await.unwrap();
    assert_eq!(cancelled.status(), SessionStatus::Cancelled);
    assert_eq!(storage.aborted.lock().await.len(), 1);
    assert!(manager.cancel(tenant_id, session.id()).await.is_err());
}

#[tokio::test]
async fn test_other_tenants_cannot_see_a_session() {
    let manager = session_manager(Arc::new(InMemoryStore::new()), FakeStorage::new());
    let session = manager
        .init_single(single(Uuid::new_v4(), "k"))
        .await
        .unwrap();

    let err = manager.get(Uuid::new_v4(), session.id()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_any_write() {
    let store = InMemoryStore::new();
    let manager = session_manager(Arc::new(store.clone()), FakeStorage::new());
    let tenant_id = Uuid::new_v4();

    let mut bad_type = single(tenant_id, "a");
    bad_type.content_type = "pdf".to_string();
    assert!(matches!(
        manager.init_single(bad_type).await,
        Err(AppError::InvalidInput(_))
    ));

    let mut small_parts = multipart(tenant_id, 2);
    small_parts.part_size = Some(1024);
    assert!(matches!(
        manager.init_multipart(small_parts).await,
        Err(AppError::InvalidInput(_))
    ));

    let mut huge = multipart(tenant_id, 2);
    huge.file_size = i64::MAX;
    assert!(matches!(
        manager.init_multipart(huge).await,
        Err(AppError::InvalidInput(_))
    ));

    assert_eq!(store.session_count().await, 0);
}
