use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::models::{DownloadDestination, DownloadTask, FileAsset, OutboxMessage};
use fileflow_core::{AppError, AppResult};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{outbox, parse_column};
use crate::traits::DownloadTaskStore;

const TASK_COLUMNS: &str = "id, tenant_id, source_url, bucket, object_key, status, retry_count, \
     max_retries, callback_url, last_error, file_asset_id, created_at, started_at, completed_at";

fn task_from_row(row: &PgRow) -> Result<DownloadTask, sqlx::Error> {
    Ok(DownloadTask {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source_url: row.get("source_url"),
        destination: DownloadDestination {
            bucket: row.get("bucket"),
            key: row.get("object_key"),
        },
        status: parse_column(row.get("status"), "status")?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        callback_url: row.get("callback_url"),
        last_error: row.get("last_error"),
        file_asset_id: row.get("file_asset_id"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn asset_from_row(row: &PgRow) -> Result<FileAsset, sqlx::Error> {
    Ok(FileAsset {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        origin: parse_column(row.get("origin"), "origin")?,
        origin_id: row.get("origin_id"),
        bucket: row.get("bucket"),
        key: row.get("object_key"),
        content_type: row.get("content_type"),
        size_bytes: row.get("size_bytes"),
        etag: row.get("etag"),
        created_at: row.get("created_at"),
    })
}

/// Repository for download tasks and the file assets they produce
#[derive(Clone)]
pub struct DownloadTaskRepository {
    pool: PgPool,
}

impl DownloadTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DownloadTaskStore for DownloadTaskRepository {
    #[tracing::instrument(skip(self, task, outbox), fields(task_id = %task.id))]
    async fn insert_task(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO download_tasks (
                id, tenant_id, source_url, bucket, object_key, status, retry_count,
                max_retries, callback_url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id)
        .bind(task.tenant_id)
        .bind(&task.source_url)
        .bind(&task.destination.bucket)
        .bind(&task.destination.key)
        .bind(task.status.to_string())
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.callback_url)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await?;

        outbox::insert_in_tx(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_task(&self, task_id: Uuid) -> AppResult<Option<DownloadTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM download_tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    async fn try_start(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<Option<DownloadTask>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE download_tasks
            SET status = 'in_progress',
                started_at = $2,
                retry_count = CASE WHEN status = 'queued' THEN retry_count ELSE retry_count + 1 END
            WHERE id = $1
              AND (
                status = 'queued'
                OR (status = 'failed' AND retry_count < max_retries)
                OR (status = 'in_progress' AND started_at < $3 AND retry_count < max_retries)
              )
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    #[tracing::instrument(skip(self, task, asset, outbox), fields(task_id = %task.id))]
    async fn record_success(
        &self,
        task: &DownloadTask,
        asset: &FileAsset,
        outbox: &[OutboxMessage],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO file_assets (
                id, tenant_id, origin, origin_id, bucket, object_key, content_type,
                size_bytes, etag, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(asset.id)
        .bind(asset.tenant_id)
        .bind(asset.origin.to_string())
        .bind(asset.origin_id)
        .bind(&asset.bucket)
        .bind(&asset.key)
        .bind(&asset.content_type)
        .bind(asset.size_bytes)
        .bind(&asset.etag)
        .bind(asset.created_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE download_tasks
            SET status = 'completed', file_asset_id = $2, last_error = NULL, completed_at = $3
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(task.id)
        .bind(asset.id)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(AppError::Conflict(format!(
                "download task {} is no longer in progress",
                task.id
            )));
        }

        outbox::insert_in_tx(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task, outbox), fields(task_id = %task.id))]
    async fn record_failure(&self, task: &DownloadTask, outbox: &[OutboxMessage]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE download_tasks
            SET status = 'failed', last_error = $2, completed_at = $3
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(task.id)
        .bind(&task.last_error)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(AppError::Conflict(format!(
                "download task {} is no longer in progress",
                task.id
            )));
        }

        outbox::insert_in_tx(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_file_asset(&self, asset_id: Uuid) -> AppResult<Option<FileAsset>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, origin, origin_id, bucket, object_key, content_type,
                   size_bytes, etag, created_at
            FROM file_assets
            WHERE id = $1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(asset_from_row).transpose()?)
    }
}
