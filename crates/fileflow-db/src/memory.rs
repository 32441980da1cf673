//! In-memory store
//!
//! One mutex guards every table, so each trait call behaves like a single
//! serializable transaction. Used by tests and by local runs without Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::models::{
    DownloadStatus, DownloadTask, FileAsset, OutboxMessage, OutboxStatus, UploadSession,
};
use fileflow_core::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::traits::{DownloadTaskStore, OutboxStore, SessionStore};

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, UploadSession>,
    outbox: HashMap<Uuid, OutboxMessage>,
    tasks: HashMap<Uuid, DownloadTask>,
    assets: HashMap<Uuid, FileAsset>,
}

impl State {
    fn insert_outbox(&mut self, messages: &[OutboxMessage]) -> AppResult<()> {
        if let Some(dup) = messages.iter().find(|m| self.outbox.contains_key(&m.id)) {
            return Err(AppError::Conflict(format!("outbox message {} already exists", dup.id)));
        }
        for msg in messages {
            self.outbox.insert(msg.id, msg.clone());
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox row, oldest first.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        let state = self.state.lock().await;
        let mut messages: Vec<_> = state.outbox.values().cloned().collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    pub async fn outbox_for(&self, aggregate_id: Uuid) -> Vec<OutboxMessage> {
        self.outbox_messages()
            .await
            .into_iter()
            .filter(|m| m.aggregate_id == aggregate_id)
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn file_assets(&self) -> Vec<FileAsset> {
        self.state.lock().await.assets.values().cloned().collect()
    }

    /// Overwrite a stored outbox row as-is.
    pub async fn put_message(&self, message: OutboxMessage) {
        self.state.lock().await.outbox.insert(message.id, message);
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn insert_session(&self, session: &UploadSession) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.id()) {
            return Err(AppError::Conflict(format!(
                "upload session {} already exists",
                session.id()
            )));
        }
        if let Some(key) = session.idempotency_key() {
            let clash = state.sessions.values().any(|s| {
                s.tenant_id() == session.tenant_id() && s.idempotency_key() == Some(key)
            });
            if clash {
                return Err(AppError::Conflict(format!(
                    "idempotency key already used for tenant {}",
                    session.tenant_id()
                )));
            }
        }
        state.sessions.insert(session.id(), session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> AppResult<Option<UploadSession>> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<UploadSession>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .find(|s| s.tenant_id() == tenant_id && s.idempotency_key() == Some(idempotency_key))
            .cloned())
    }

    async fn save_session(
        &self,
        session: &UploadSession,
        outbox: &[OutboxMessage],
    ) -> AppResult<UploadSession> {
        let mut state = self.state.lock().await;
        let stored_version = state
            .sessions
            .get(&session.id())
            .map(|s| s.version())
            .ok_or_else(|| AppError::NotFound(format!("upload session {}", session.id())))?;

        if stored_version != session.version() {
            return Err(AppError::Conflict(format!(
                "upload session {} was modified concurrently (expected version {})",
                session.id(),
                session.version()
            )));
        }

        state.insert_outbox(outbox)?;
        let mut saved = session.clone();
        saved.set_version(stored_version + 1);
        state.sessions.insert(saved.id(), saved.clone());
        Ok(saved)
    }

    async fn find_expirable(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<UploadSession>> {
        let state = self.state.lock().await;
        let mut expirable: Vec<_> = state
            .sessions
            .values()
            .filter(|s| !s.status().is_terminal() && s.expires_at() < now)
            .cloned()
            .collect();
        expirable.sort_by_key(|s| s.expires_at());
        expirable.truncate(limit.max(0) as usize);
        Ok(expirable)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn insert_messages(&self, messages: &[OutboxMessage]) -> AppResult<()> {
        self.state.lock().await.insert_outbox(messages)
    }

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<OutboxMessage>> {
        Ok(self.state.lock().await.outbox.get(&message_id).cloned())
    }

    async fn try_claim(
        &self,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<OutboxMessage>> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(&message_id) {
            Some(msg) if msg.status == OutboxStatus::Pending => {
                msg.status = OutboxStatus::Processing;
                msg.claimed_at = Some(now);
                Ok(Some(msg.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_processed(&self, message_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(&message_id) {
            Some(msg) if msg.status == OutboxStatus::Processing => {
                msg.status = OutboxStatus::Processed;
                msg.processed_at = Some(now);
                msg.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> AppResult<Option<OutboxMessage>> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(&message_id) {
            Some(msg) if msg.status == OutboxStatus::Processing => {
                msg.status = OutboxStatus::Failed;
                msg.last_error = Some(error.to_string());
                msg.retry_count += 1;
                Ok(Some(msg.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_pending_before(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .outbox
            .values()
            .filter(|m| m.status == OutboxStatus::Pending && m.created_at < created_before)
            .collect();
        pending.sort_by_key(|m| m.created_at);
        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|m| m.id)
            .collect())
    }

    async fn reset_failed(&self, max_retries: i32, limit: i64) -> AppResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .outbox
            .values()
            .filter(|m| m.can_retry(max_retries))
            .map(|m| (m.created_at, m.id))
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);

        for (_, id) in &ids {
            if let Some(msg) = state.outbox.get_mut(id) {
                msg.status = OutboxStatus::Pending;
                msg.claimed_at = None;
            }
        }
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn fail_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let mut stale: Vec<_> = state
            .outbox
            .values()
            .filter(|m| {
                m.status == OutboxStatus::Processing
                    && m.claimed_at.is_some_and(|at| at < claimed_before)
            })
            .map(|m| (m.claimed_at, m.id))
            .collect();
        stale.sort();
        stale.truncate(limit.max(0) as usize);

        for (_, id) in &stale {
            if let Some(msg) = state.outbox.get_mut(id) {
                msg.status = OutboxStatus::Failed;
                msg.retry_count += 1;
                msg.last_error = Some("processing claim expired".to_string());
            }
        }
        Ok(stale.len() as u64)
    }
}

#[async_trait]
impl DownloadTaskStore for InMemoryStore {
    async fn insert_task(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(AppError::Conflict(format!("download task {} already exists", task.id)));
        }
        state.insert_outbox(outbox)?;
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_task(&self, task_id: Uuid) -> AppResult<Option<DownloadTask>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn try_start(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<Option<DownloadTask>> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) => Ok(task.start(now, stale_before).then(|| task.clone())),
            None => Ok(None),
        }
    }

    async fn record_success(
        &self,
        task: &DownloadTask,
        asset: &FileAsset,
        outbox: &[OutboxMessage],
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let in_progress = state
            .tasks
            .get(&task.id)
            .is_some_and(|t| t.status == DownloadStatus::InProgress);
        if !in_progress {
            return Err(AppError::Conflict(format!(
                "download task {} is no longer in progress",
                task.id
            )));
        }
        state.insert_outbox(outbox)?;
        state.assets.insert(asset.id, asset.clone());
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn record_failure(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let in_progress = state
            .tasks
            .get(&task.id)
            .is_some_and(|t| t.status == DownloadStatus::InProgress);
        if !in_progress {
            return Err(AppError::Conflict(format!(
                "download task {} is no longer in progress",
                task.id
            )));
        }
        state.insert_outbox(outbox)?;
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_file_asset(&self, asset_id: Uuid) -> AppResult<Option<FileAsset>> {
        Ok(self.state.lock().await.assets.get(&asset_id).cloned())
    }
}
