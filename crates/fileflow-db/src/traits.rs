//! Store traits
//!
//! The services crate and the workers only see these traits. Implementations
//! must guarantee that any outbox rows passed alongside a write are committed
//! or rolled back together with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::models::{DownloadTask, FileAsset, OutboxMessage, UploadSession};
use fileflow_core::AppResult;
use uuid::Uuid;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a brand new session. A clash on `(tenant_id, idempotency_key)`
    /// yields `AppError::Conflict`.
    async fn insert_session(&self, session: &UploadSession) -> AppResult<()>;

    async fn find_session(&self, session_id: Uuid) -> AppResult<Option<UploadSession>>;

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<UploadSession>>;

    /// Persist `session` if the stored version still equals `session.version()`,
    /// inserting `outbox` in the same transaction. Returns the session carrying
    /// its new version. A stale version yields `AppError::Conflict`.
    async fn save_session(
        &self,
        session: &UploadSession,
        outbox: &[OutboxMessage],
    ) -> AppResult<UploadSession>;

    /// Non-terminal sessions whose deadline is before `now`, oldest first.
    async fn find_expirable(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<UploadSession>>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert rows whose triggering change is the row itself (e.g. a transform request).
    async fn insert_messages(&self, messages: &[OutboxMessage]) -> AppResult<()>;

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<OutboxMessage>>;

    /// Conditional PENDING -> PROCESSING. `None` means another worker owns the
    /// row or it is no longer pending.
    async fn try_claim(&self, message_id: Uuid, now: DateTime<Utc>)
        -> AppResult<Option<OutboxMessage>>;

    /// PROCESSING -> PROCESSED. Returns false if the row was not PROCESSING.
    async fn mark_processed(&self, message_id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    /// PROCESSING -> FAILED, recording the error and incrementing the retry count.
    async fn mark_failed(&self, message_id: Uuid, error: &str) -> AppResult<Option<OutboxMessage>>;

    /// Ids of PENDING rows created before `created_before`, oldest first.
    async fn find_pending_before(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Uuid>>;

    /// FAILED rows with `retry_count < max_retries` go back to PENDING.
    async fn reset_failed(&self, max_retries: i32, limit: i64) -> AppResult<Vec<Uuid>>;

    /// PROCESSING rows claimed before `claimed_before` are treated as an
    /// abandoned attempt: FAILED with the retry count incremented.
    async fn fail_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<u64>;
}

#[async_trait]
pub trait DownloadTaskStore: Send + Sync {
    /// Insert a QUEUED task with its outbox rows.
    async fn insert_task(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()>;

    async fn find_task(&self, task_id: Uuid) -> AppResult<Option<DownloadTask>>;

    /// Conditionally move a QUEUED task to IN_PROGRESS, or restart a FAILED
    /// one, or an IN_PROGRESS one started before `stale_before`, when a retry
    /// is still owed. Restarts increment the retry count. `None` when the task
    /// cannot be started.
    async fn try_start(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<Option<DownloadTask>>;

    /// One transaction: task COMPLETED, file asset inserted, outbox rows inserted.
    async fn record_success(
        &self,
        task: &DownloadTask,
        asset: &FileAsset,
        outbox: &[OutboxMessage],
    ) -> AppResult<()>;

    /// One transaction: task FAILED with its error, outbox rows inserted.
    async fn record_failure(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()>;

    async fn find_file_asset(&self, asset_id: Uuid) -> AppResult<Option<FileAsset>>;
}
