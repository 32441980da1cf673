use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::models::OutboxMessage;
use fileflow_core::AppError;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::parse_column;
use crate::traits::OutboxStore;

const OUTBOX_COLUMNS: &str = "id, kind, aggregate_id, payload, status, retry_count, last_error, \
                              created_at, claimed_at, processed_at";

fn outbox_from_row(row: &PgRow) -> Result<OutboxMessage, sqlx::Error> {
    Ok(OutboxMessage {
        id: row.get("id"),
        kind: parse_column(row.get("kind"), "kind")?,
        aggregate_id: row.get("aggregate_id"),
        payload: row.get("payload"),
        status: parse_column(row.get("status"), "status")?,
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        processed_at: row.get("processed_at"),
    })
}

/// Insert outbox rows inside the caller's transaction.
pub(crate) async fn insert_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    messages: &[OutboxMessage],
) -> Result<(), sqlx::Error> {
    for msg in messages {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, kind, aggregate_id, payload, status, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(msg.id)
        .bind(msg.kind.to_string())
        .bind(msg.aggregate_id)
        .bind(&msg.payload)
        .bind(msg.status.to_string())
        .bind(msg.retry_count)
        .bind(msg.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Repository for outbox rows
#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn insert_messages(&self, messages: &[OutboxMessage]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        insert_in_tx(&mut tx, messages).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<OutboxMessage>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE id = $1",
            OUTBOX_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(outbox_from_row).transpose()?)
    }

    async fn try_claim(
        &self,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxMessage>, AppError> {
        // Single conditional statement: concurrent claimers serialize on the row
        // lock and the loser's predicate no longer matches.
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_messages
            SET status = 'processing', claimed_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(message_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(outbox_from_row).transpose()?)
    }

    async fn mark_processed(&self, message_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'processed', processed_at = $2, last_error = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(message_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<Option<OutboxMessage>, AppError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', last_error = $2, retry_count = retry_count + 1
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(message_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(outbox_from_row).transpose()?)
    }

    async fn find_pending_before(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM outbox_messages
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn reset_failed(&self, max_retries: i32, limit: i64) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', claimed_at = NULL
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'failed' AND retry_count < $1
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn fail_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = 'processing claim expired'
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'processing' AND claimed_at < $1
                ORDER BY claimed_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(claimed_before)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
