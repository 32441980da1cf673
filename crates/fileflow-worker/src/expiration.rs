//! Periodic expiration of sessions whose deadline has passed.

use chrono::{DateTime, Utc};
use fileflow_core::models::UploadSession;
use fileflow_core::{AppError, AppResult, NoopSessionCache, SessionCache};
use fileflow_db::SessionStore;
use fileflow_storage::ObjectStorageClient;
use std::sync::Arc;
use std::time::Duration;

use crate::periodic::PeriodicTask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationStats {
    pub expired: usize,
    /// Sessions that changed under the sweep (completed or cancelled meanwhile).
    pub conflicts: usize,
    pub aborted_uploads: usize,
}

pub struct SessionExpirationSweeper {
    sessions: Arc<dyn SessionStore>,
    storage: Arc<dyn ObjectStorageClient>,
    cache: Arc<dyn SessionCache>,
    batch_size: i64,
    interval: Duration,
}

impl SessionExpirationSweeper {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        storage: Arc<dyn ObjectStorageClient>,
        batch_size: i64,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            storage,
            cache: Arc::new(NoopSessionCache),
            batch_size,
            interval,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = cache;
        self
    }

    #[tracing::instrument(skip(self))]
    pub async fn expire_once_at(&self, now: DateTime<Utc>) -> AppResult<ExpirationStats> {
        let mut stats = ExpirationStats::default();
        let candidates = self.sessions.find_expirable(now, self.batch_size).await?;

        for mut session in candidates {
            let session_id = session.id();
            if let Err(e) = session.expire(now) {
                tracing::debug!(error = %e, session_id = %session_id, "Session not expirable");
                continue;
            }

            match self.sessions.save_session(&session, &[]).await {
                Ok(saved) => {
                    stats.expired += 1;
                    if let Err(e) = self.cache.invalidate(session_id).await {
                        tracing::warn!(error = %e, session_id = %session_id, "Cache invalidation failed");
                    }
                    if self.abort_provider_upload(&saved).await {
                        stats.aborted_uploads += 1;
                    }
                }
                Err(AppError::Conflict(_)) => {
                    stats.conflicts += 1;
                    tracing::debug!(session_id = %session_id, "Session changed during expiration, skipping");
                }
                Err(e) => {
                    tracing::warn!(error = %e, session_id = %session_id, "Failed to expire session");
                }
            }
        }

        if stats.expired > 0 || stats.conflicts > 0 {
            tracing::info!(
                expired = stats.expired,
                conflicts = stats.conflicts,
                aborted_uploads = stats.aborted_uploads,
                "Session expiration sweep finished"
            );
        }
        Ok(stats)
    }

    /// Best effort: a failed abort leaves the parts to the bucket lifecycle rules.
    async fn abort_provider_upload(&self, session: &UploadSession) -> bool {
        let UploadSession::Multipart(m) = session else {
            return false;
        };
        let Some(upload_id) = m.provider_upload_id.as_deref() else {
            return false;
        };
        match self
            .storage
            .abort_multipart_upload(&m.target.bucket, &m.target.key, upload_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    session_id = %m.id,
                    upload_id = %upload_id,
                    "Failed to abort multipart upload for expired session"
                );
                false
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> PeriodicTask {
        let interval = self.interval;
        PeriodicTask::spawn("session-expiration", interval, move || {
            let sweeper = self.clone();
            async move {
                if let Err(e) = sweeper.expire_once_at(Utc::now()).await {
                    tracing::error!(error = %e, "Session expiration sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fileflow_core::models::{AccessType, CompletedPart, SessionStatus, UploadTarget};
    use fileflow_db::InMemoryStore;
    use fileflow_storage::{ObjectMetadata, StorageError, StorageResult};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct AbortRecorder {
        aborted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStorageClient for AbortRecorder {
        async fn generate_presigned_url(&self, _: &str, _: &str, _: &str, _: Duration) -> StorageResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }

        async fn initiate_multipart_upload(&self, _: &str, _: &str, _: &str) -> StorageResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }

        async fn generate_presigned_part_url(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: i32,
            _: Duration,
        ) -> StorageResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }

        async fn complete_multipart_upload(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &[CompletedPart],
        ) -> StorageResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }

        async fn abort_multipart_upload(&self, _: &str, _: &str, upload_id: &str) -> StorageResult<()> {
            self.aborted.lock().await.push(upload_id.to_string());
            Ok(())
        }

        async fn head_object(&self, _: &str, _: &str) -> StorageResult<Option<ObjectMetadata>> {
            Ok(None)
        }

        async fn put_object(&self, _: &str, _: &str, _: &str, _: bytes::Bytes) -> StorageResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }
    }

    fn target() -> UploadTarget {
        UploadTarget {
            bucket: "b".to_string(),
            key: "k".to_string(),
            access_type: AccessType::Private,
            file_name: "f.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
        }
    }

    #[tokio::test]
    async fn test_expires_overdue_sessions_and_aborts_multipart() {
        let store = InMemoryStore::new();
        let storage = Arc::new(AbortRecorder::default());

        let mut multipart = UploadSession::for_new_multipart(
            Uuid::new_v4(),
            target(),
            5 * 1024 * 1024,
            2,
            None,
            chrono::Duration::minutes(10),
        );
        if let UploadSession::Multipart(m) = &mut multipart {
            m.activate("upload-1".to_string(), Utc::now()).unwrap();
        }
        store.insert_session(&multipart).await.unwrap();

        let single = UploadSession::for_new_single(
            Uuid::new_v4(),
            target(),
            "idem".to_string(),
            chrono::Duration::hours(2),
            None,
        );
        store.insert_session(&single).await.unwrap();

        let sweeper = SessionExpirationSweeper::new(
            Arc::new(store.clone()),
            storage.clone(),
            100,
            Duration::from_secs(60),
        );
        let now = Utc::now() + chrono::Duration::minutes(30);
        let stats = sweeper.expire_once_at(now).await.unwrap();

        assert_eq!(stats.expired, 1);
        assert_eq!(stats.aborted_uploads, 1);
        assert_eq!(*storage.aborted.lock().await, vec!["upload-1".to_string()]);

        let expired = store.find_session(multipart.id()).await.unwrap().unwrap();
        assert_eq!(expired.status(), SessionStatus::Expired);
        let untouched = store.find_session(single.id()).await.unwrap().unwrap();
        assert_eq!(untouched.status(), SessionStatus::Preparing);

        let again = sweeper.expire_once_at(now).await.unwrap();
        assert_eq!(again, ExpirationStats::default());
    }
}
