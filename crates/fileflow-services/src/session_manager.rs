//! Upload session lifecycle
//!
//! Init is idempotent per `(tenant_id, idempotency_key)`: a find-before-create
//! check answers the common retry, and the unique index answers the race. The
//! session row is written in PREPARING before object storage is touched, so a
//! storage failure leaves a FAILED row behind instead of an orphaned handle.
//!
//! Completion from the API and from storage notifications both end in
//! [`UploadSession::complete`] followed by the same outbox write.

use chrono::Utc;
use fileflow_core::models::{
    AccessType, OutboxMessage, PipelinePayload, SessionStatus, UploadSession, UploadTarget,
};
use fileflow_core::{AppError, AppResult, NoopSessionCache, OutboxSignal, SessionCache, SessionError};
use fileflow_db::SessionStore;
use fileflow_storage::{canonical_etag, upload_object_key, ObjectStorageClient};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{signal_committed, storage_error};

/// Smallest part size object storage accepts for every part but the last.
pub const MIN_PART_SIZE: i64 = 5 * 1024 * 1024;
pub const MAX_PARTS: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub bucket: String,
    pub session_ttl: chrono::Duration,
    pub presigned_url_ttl: Duration,
    pub cache_ttl: Duration,
    pub default_part_size: i64,
}

#[derive(Debug, Clone)]
pub struct InitSingleUpload {
    pub tenant_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub access_type: AccessType,
    pub idempotency_key: String,
    /// Hex MD5 of the content, checked against the stored object on completion.
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitMultipartUpload {
    pub tenant_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub access_type: AccessType,
    pub file_size: i64,
    pub part_size: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(UploadSession),
    /// Already COMPLETED with the same eTag; nothing was written.
    AlreadyCompleted(UploadSession),
}

pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    storage: Arc<dyn ObjectStorageClient>,
    cache: Arc<dyn SessionCache>,
    signal: Arc<dyn OutboxSignal>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        storage: Arc<dyn ObjectStorageClient>,
        signal: Arc<dyn OutboxSignal>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions,
            storage,
            cache: Arc::new(NoopSessionCache),
            signal,
            settings,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = cache;
        self
    }

    #[tracing::instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id))]
    pub async fn init_single(&self, cmd: InitSingleUpload) -> AppResult<UploadSession> {
        validate_file(&cmd.file_name, &cmd.content_type)?;
        if cmd.idempotency_key.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "idempotency key must not be empty".to_string(),
            ));
        }
        let expected_checksum = cmd
            .expected_checksum
            .as_deref()
            .map(normalize_checksum)
            .transpose()?;

        if let Some(existing) = self
            .sessions
            .find_by_idempotency_key(cmd.tenant_id, &cmd.idempotency_key)
            .await?
        {
            tracing::debug!(session_id = %existing.id(), "Idempotency key reused, returning existing session");
            return Ok(existing);
        }

        let mut session = UploadSession::for_new_single(
            cmd.tenant_id,
            self.target(cmd.file_name, cmd.content_type, cmd.access_type),
            cmd.idempotency_key,
            self.settings.session_ttl,
            expected_checksum,
        );
        assign_object_key(&mut session)?;
        if let Some(existing) = self.insert_or_existing(&session).await? {
            return Ok(existing);
        }

        let target = session.target().clone();
        let url = match self
            .storage
            .generate_presigned_url(
                &target.bucket,
                &target.key,
                &target.content_type,
                self.settings.presigned_url_ttl,
            )
            .await
        {
            Ok(url) => url,
            Err(e) => return Err(self.abandon(session, storage_error(e)).await),
        };

        if let UploadSession::Single(s) = &mut session {
            s.activate(url)?;
        }
        let saved = self.sessions.save_session(&session, &[]).await?;
        self.cache_put(&saved).await;

        tracing::info!(session_id = %saved.id(), key = %target.key, "Single upload session created");
        Ok(saved)
    }

    #[tracing::instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id, file_size = cmd.file_size))]
    pub async fn init_multipart(&self, cmd: InitMultipartUpload) -> AppResult<UploadSession> {
        validate_file(&cmd.file_name, &cmd.content_type)?;
        let part_size = cmd.part_size.unwrap_or(self.settings.default_part_size);
        let total_parts = total_parts(cmd.file_size, part_size)?;
        let idempotency_key = cmd.idempotency_key.filter(|k| !k.trim().is_empty());

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.sessions.find_by_idempotency_key(cmd.tenant_id, key).await? {
                tracing::debug!(session_id = %existing.id(), "Idempotency key reused, returning existing session");
                return Ok(existing);
            }
        }

        let mut session = UploadSession::for_new_multipart(
            cmd.tenant_id,
            self.target(cmd.file_name, cmd.content_type, cmd.access_type),
            part_size,
            total_parts,
            idempotency_key,
            self.settings.session_ttl,
        );
        assign_object_key(&mut session)?;
        if let Some(existing) = self.insert_or_existing(&session).await? {
            return Ok(existing);
        }

        let target = session.target().clone();
        let upload_id = match self
            .storage
            .initiate_multipart_upload(&target.bucket, &target.key, &target.content_type)
            .await
        {
            Ok(upload_id) => upload_id,
            Err(e) => return Err(self.abandon(session, storage_error(e)).await),
        };

        if let UploadSession::Multipart(m) = &mut session {
            m.activate(upload_id, Utc::now())?;
        }
        let saved = self.sessions.save_session(&session, &[]).await?;
        self.cache_put(&saved).await;

        tracing::info!(
            session_id = %saved.id(),
            total_parts = total_parts,
            part_size = part_size,
            "Multipart upload session created"
        );
        Ok(saved)
    }

    /// Presigned URL for one part of an open multipart session.
    #[tracing::instrument(skip(self))]
    pub async fn part_upload_url(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        part_number: i32,
    ) -> AppResult<String> {
        let session = self.get(tenant_id, session_id).await?;
        let UploadSession::Multipart(m) = &session else {
            return Err(SessionError::UnsupportedOperation("single").into());
        };
        if !matches!(m.status, SessionStatus::Active | SessionStatus::InProgress) {
            return Err(SessionError::InvalidTransition {
                from: m.status,
                to: SessionStatus::InProgress,
            }
            .into());
        }
        if session.is_expired_at(Utc::now()) {
            return Err(AppError::InvalidInput(format!(
                "upload session {} has expired",
                session_id
            )));
        }
        if part_number < 1 || part_number > m.total_parts {
            return Err(SessionError::InvalidPartNumber {
                part_number,
                total_parts: m.total_parts,
            }
            .into());
        }
        let upload_id = m.provider_upload_id.as_deref().ok_or_else(|| {
            AppError::Internal(format!("multipart session {} has no provider upload id", m.id))
        })?;

        self.storage
            .generate_presigned_part_url(
                &m.target.bucket,
                &m.target.key,
                upload_id,
                part_number,
                self.settings.presigned_url_ttl,
            )
            .await
            .map_err(storage_error)
    }

    #[tracing::instrument(skip(self, etag))]
    pub async fn mark_part_uploaded(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        part_number: i32,
        etag: String,
        size: i64,
    ) -> AppResult<UploadSession> {
        let mut session = self.load_for_write(tenant_id, session_id).await?;
        session.mark_part_uploaded(part_number, etag, size, Utc::now())?;
        let saved = self.sessions.save_session(&session, &[]).await?;
        self.cache_put(&saved).await;
        tracing::debug!(part_number = part_number, "Part recorded");
        Ok(saved)
    }

    /// Synchronous completion. For multipart sessions the provider upload is
    /// finalized first and its eTag becomes the session's. The eTag is stored
    /// in canonical form so a later storage notification for the same object
    /// is recognised as a duplicate.
    #[tracing::instrument(skip(self, etag))]
    pub async fn complete(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        etag: Option<String>,
    ) -> AppResult<UploadSession> {
        let mut session = self.load_for_write(tenant_id, session_id).await?;

        let etag = match &session {
            UploadSession::Single(_) => etag.as_deref().map(canonical_etag),
            UploadSession::Multipart(m) => {
                if !m.status.can_transition_to(SessionStatus::Completed) {
                    return Err(SessionError::InvalidTransition {
                        from: m.status,
                        to: SessionStatus::Completed,
                    }
                    .into());
                }
                m.verify_parts()?;
                let upload_id = m.provider_upload_id.as_deref().ok_or_else(|| {
                    AppError::Internal(format!("multipart session {} has no provider upload id", m.id))
                })?;
                // Irreversible; if the save below loses a race, the storage
                // notification for the finished object completes the session.
                let provider_etag = self
                    .storage
                    .complete_multipart_upload(&m.target.bucket, &m.target.key, upload_id, &m.parts)
                    .await
                    .map_err(storage_error)?;
                Some(canonical_etag(&provider_etag))
            }
        };

        session.complete(etag, Utc::now())?;
        self.commit_completion(session).await
    }

    /// Completion driven by a storage notification. A session already
    /// COMPLETED with the same eTag is a duplicate event and is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn apply_storage_completion(
        &self,
        session_id: Uuid,
        etag: &str,
    ) -> AppResult<CompletionOutcome> {
        let mut session = self.find_session(session_id).await?;
        let etag = canonical_etag(etag);
        let etag = etag.as_str();

        if session.status() == SessionStatus::Completed {
            let stored = session.etag().unwrap_or_default().to_string();
            if stored == etag {
                return Ok(CompletionOutcome::AlreadyCompleted(session));
            }
            return Err(AppError::ChecksumMismatch {
                key: session.target().key.clone(),
                expected: stored,
                actual: etag.to_string(),
            });
        }

        session.complete(Some(etag.to_string()), Utc::now())?;
        self.commit_completion(session)
            .await
            .map(CompletionOutcome::Completed)
    }

    /// Cancel a non-terminal session. Multipart provider uploads are aborted
    /// after the state change is stored; a failed abort is only logged.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, tenant_id: Uuid, session_id: Uuid) -> AppResult<UploadSession> {
        let mut session = self.load_for_write(tenant_id, session_id).await?;
        session.cancel(Utc::now())?;
        let saved = self.sessions.save_session(&session, &[]).await?;
        self.cache_invalidate(session_id).await;

        if let UploadSession::Multipart(m) = &saved {
            if let Some(upload_id) = m.provider_upload_id.as_deref() {
                if let Err(e) = self
                    .storage
                    .abort_multipart_upload(&m.target.bucket, &m.target.key, upload_id)
                    .await
                {
                    tracing::warn!(error = %e, upload_id = %upload_id, "Failed to abort multipart upload");
                }
            }
        }

        tracing::info!(session_id = %session_id, "Upload session cancelled");
        Ok(saved)
    }

    /// Read through the cache. Sessions of other tenants are reported as missing.
    pub async fn get(&self, tenant_id: Uuid, session_id: Uuid) -> AppResult<UploadSession> {
        match self.cache.get(session_id).await {
            Ok(Some(session)) if session.tenant_id() == tenant_id => return Ok(session),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, session_id = %session_id, "Session cache read failed"),
        }

        let session = self.load_for_write(tenant_id, session_id).await?;
        self.cache_put(&session).await;
        Ok(session)
    }

    /// Uncached lookup by id only.
    pub async fn find_session(&self, session_id: Uuid) -> AppResult<UploadSession> {
        self.sessions
            .find_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload session {}", session_id)))
    }

    async fn load_for_write(&self, tenant_id: Uuid, session_id: Uuid) -> AppResult<UploadSession> {
        let session = self.find_session(session_id).await?;
        if session.tenant_id() != tenant_id {
            return Err(AppError::NotFound(format!("upload session {}", session_id)));
        }
        Ok(session)
    }

    async fn commit_completion(&self, session: UploadSession) -> AppResult<UploadSession> {
        let target = session.target();
        let message = OutboxMessage::new(
            session.id(),
            &PipelinePayload {
                session_id: session.id(),
                tenant_id: session.tenant_id(),
                bucket: target.bucket.clone(),
                key: target.key.clone(),
                content_type: target.content_type.clone(),
                etag: session.etag().map(str::to_string),
            },
        )
        .map_err(|e| AppError::Internal(format!("Failed to encode pipeline payload: {}", e)))?;

        let outbox = [message];
        let saved = self.sessions.save_session(&session, &outbox).await?;
        signal_committed(self.signal.as_ref(), &outbox);
        self.cache_put(&saved).await;

        tracing::info!(
            session_id = %saved.id(),
            kind = %saved.kind(),
            etag = saved.etag().unwrap_or_default(),
            "Upload session completed"
        );
        Ok(saved)
    }

    /// Insert a new session. On an idempotency clash the winner is returned.
    async fn insert_or_existing(&self, session: &UploadSession) -> AppResult<Option<UploadSession>> {
        match self.sessions.insert_session(session).await {
            Ok(()) => Ok(None),
            Err(AppError::Conflict(msg)) => {
                let Some(key) = session.idempotency_key() else {
                    return Err(AppError::Conflict(msg));
                };
                match self
                    .sessions
                    .find_by_idempotency_key(session.tenant_id(), key)
                    .await?
                {
                    Some(existing) => {
                        tracing::debug!(session_id = %existing.id(), "Lost idempotent init race, returning winner");
                        Ok(Some(existing))
                    }
                    None => Err(AppError::Conflict(msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a PREPARING session FAILED after its storage call failed.
    async fn abandon(&self, mut session: UploadSession, cause: AppError) -> AppError {
        tracing::warn!(error = %cause, session_id = %session.id(), "Storage rejected session init");
        if session.fail(cause.to_string()).is_ok() {
            if let Err(e) = self.sessions.save_session(&session, &[]).await {
                tracing::error!(error = %e, session_id = %session.id(), "Failed to record failed session");
            }
        }
        cause
    }

    fn target(&self, file_name: String, content_type: String, access_type: AccessType) -> UploadTarget {
        UploadTarget {
            bucket: self.settings.bucket.clone(),
            key: String::new(),
            access_type,
            file_name,
            content_type,
        }
    }

    async fn cache_put(&self, session: &UploadSession) {
        if let Err(e) = self.cache.set(session, self.settings.cache_ttl).await {
            tracing::warn!(error = %e, session_id = %session.id(), "Session cache write failed");
        }
    }

    async fn cache_invalidate(&self, session_id: Uuid) {
        if let Err(e) = self.cache.invalidate(session_id).await {
            tracing::warn!(error = %e, session_id = %session_id, "Session cache invalidation failed");
        }
    }
}

fn assign_object_key(session: &mut UploadSession) -> AppResult<()> {
    let key = upload_object_key(session.tenant_id(), session.id(), &session.target().file_name)
        .map_err(storage_error)?;
    match session {
        UploadSession::Single(s) => s.target.key = key,
        UploadSession::Multipart(m) => m.target.key = key,
    }
    Ok(())
}

fn validate_file(file_name: &str, content_type: &str) -> AppResult<()> {
    if file_name.trim().is_empty() {
        return Err(AppError::InvalidInput("file name must not be empty".to_string()));
    }
    if content_type.trim().is_empty() || !content_type.contains('/') {
        return Err(AppError::InvalidInput(format!(
            "invalid content type: {:?}",
            content_type
        )));
    }
    Ok(())
}

fn normalize_checksum(raw: &str) -> AppResult<String> {
    let checksum = raw.trim().trim_matches('"').to_ascii_lowercase();
    if checksum.len() != 32 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::InvalidInput(format!(
            "expected checksum must be a hex MD5 digest, got {:?}",
            raw
        )));
    }
    Ok(checksum)
}

fn total_parts(file_size: i64, part_size: i64) -> AppResult<i32> {
    if file_size <= 0 {
        return Err(AppError::InvalidInput("file size must be positive".to_string()));
    }
    if part_size < MIN_PART_SIZE {
        return Err(AppError::InvalidInput(format!(
            "part size must be at least {} bytes",
            MIN_PART_SIZE
        )));
    }
    // Rounds up without overflowing for sizes near i64::MAX.
    let parts = (file_size - 1) / part_size + 1;
    if parts > MAX_PARTS {
        return Err(AppError::InvalidInput(format!(
            "file needs {} parts, more than the {} allowed",
            parts, MAX_PARTS
        )));
    }
    Ok(parts as i32)
}
