use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::models::{
    CompletedPart, MultipartUploadSession, SessionKind, SingleUploadSession, UploadSession,
    UploadTarget,
};
use fileflow_core::{AppError, AppResult};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{is_unique_violation, outbox, parse_column};
use crate::traits::SessionStore;

const SESSION_COLUMNS: &str = "id, tenant_id, kind, status, bucket, object_key, access_type, \
     file_name, content_type, idempotency_key, presigned_url, etag, expected_checksum, \
     provider_upload_id, part_size, total_parts, parts, failure_reason, expires_at, created_at, \
     started_at, completed_at, aborted_at, version";

fn session_from_row(row: &PgRow) -> Result<UploadSession, sqlx::Error> {
    let target = UploadTarget {
        bucket: row.get("bucket"),
        key: row.get("object_key"),
        access_type: parse_column(row.get("access_type"), "access_type")?,
        file_name: row.get("file_name"),
        content_type: row.get("content_type"),
    };
    let kind: SessionKind = parse_column(row.get("kind"), "kind")?;

    Ok(match kind {
        SessionKind::Single => UploadSession::Single(SingleUploadSession {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            target,
            presigned_url: row.get("presigned_url"),
            etag: row.get("etag"),
            expected_checksum: row.get("expected_checksum"),
            status: parse_column(row.get("status"), "status")?,
            idempotency_key: row
                .get::<Option<String>, _>("idempotency_key")
                .unwrap_or_default(),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            failure_reason: row.get("failure_reason"),
            version: row.get("version"),
        }),
        SessionKind::Multipart => UploadSession::Multipart(MultipartUploadSession {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            target,
            provider_upload_id: row.get("provider_upload_id"),
            part_size: row.get::<Option<i64>, _>("part_size").unwrap_or_default(),
            total_parts: row.get::<Option<i32>, _>("total_parts").unwrap_or_default(),
            parts: row.get::<Json<Vec<CompletedPart>>, _>("parts").0,
            status: parse_column(row.get("status"), "status")?,
            idempotency_key: row.get("idempotency_key"),
            etag: row.get("etag"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            aborted_at: row.get("aborted_at"),
            failure_reason: row.get("failure_reason"),
            version: row.get("version"),
        }),
    })
}

/// Flattened column values shared by inserts and updates
struct SessionColumns<'a> {
    presigned_url: Option<&'a str>,
    expected_checksum: Option<&'a str>,
    provider_upload_id: Option<&'a str>,
    part_size: Option<i64>,
    total_parts: Option<i32>,
    parts: &'a [CompletedPart],
    failure_reason: Option<&'a str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    aborted_at: Option<DateTime<Utc>>,
}

impl<'a> SessionColumns<'a> {
    fn of(session: &'a UploadSession) -> Self {
        match session {
            UploadSession::Single(s) => SessionColumns {
                presigned_url: s.presigned_url.as_deref(),
                expected_checksum: s.expected_checksum.as_deref(),
                provider_upload_id: None,
                part_size: None,
                total_parts: None,
                parts: &[],
                failure_reason: s.failure_reason.as_deref(),
                started_at: None,
                completed_at: s.completed_at,
                aborted_at: None,
            },
            UploadSession::Multipart(m) => SessionColumns {
                presigned_url: None,
                expected_checksum: None,
                provider_upload_id: m.provider_upload_id.as_deref(),
                part_size: Some(m.part_size),
                total_parts: Some(m.total_parts),
                parts: &m.parts,
                failure_reason: m.failure_reason.as_deref(),
                started_at: m.started_at,
                completed_at: m.completed_at,
                aborted_at: m.aborted_at,
            },
        }
    }
}

/// Repository for upload sessions
#[derive(Clone)]
pub struct UploadSessionRepository {
    pool: PgPool,
}

impl UploadSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for UploadSessionRepository {
    #[tracing::instrument(skip(self, session), fields(session_id = %session.id()))]
    async fn insert_session(&self, session: &UploadSession) -> AppResult<()> {
        let cols = SessionColumns::of(session);
        let target = session.target();
        let created_at = match session {
            UploadSession::Single(s) => s.created_at,
            UploadSession::Multipart(m) => m.created_at,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, tenant_id, kind, status, bucket, object_key, access_type, file_name,
                content_type, idempotency_key, presigned_url, etag, expected_checksum,
                provider_upload_id, part_size, total_parts, parts, failure_reason,
                expires_at, created_at, started_at, completed_at, aborted_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(session.id())
        .bind(session.tenant_id())
        .bind(session.kind().to_string())
        .bind(session.status().to_string())
        .bind(&target.bucket)
        .bind(&target.key)
        .bind(target.access_type.to_string())
        .bind(&target.file_name)
        .bind(&target.content_type)
        .bind(session.idempotency_key())
        .bind(cols.presigned_url)
        .bind(session.etag())
        .bind(cols.expected_checksum)
        .bind(cols.provider_upload_id)
        .bind(cols.part_size)
        .bind(cols.total_parts)
        .bind(Json(cols.parts))
        .bind(cols.failure_reason)
        .bind(session.expires_at())
        .bind(created_at)
        .bind(cols.started_at)
        .bind(cols.completed_at)
        .bind(cols.aborted_at)
        .bind(session.version())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(format!(
                "idempotency key already used for tenant {}",
                session.tenant_id()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_session(&self, session_id: Uuid) -> AppResult<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_sessions WHERE tenant_id = $1 AND idempotency_key = $2",
            SESSION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    #[tracing::instrument(
        skip(self, session, outbox),
        fields(session_id = %session.id(), version = session.version(), outbox = outbox.len())
    )]
    async fn save_session(
        &self,
        session: &UploadSession,
        outbox: &[fileflow_core::models::OutboxMessage],
    ) -> AppResult<UploadSession> {
        let cols = SessionColumns::of(session);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = $3,
                presigned_url = $4,
                etag = $5,
                provider_upload_id = $6,
                parts = $7,
                failure_reason = $8,
                started_at = $9,
                completed_at = $10,
                aborted_at = $11,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(session.id())
        .bind(session.version())
        .bind(session.status().to_string())
        .bind(cols.presigned_url)
        .bind(session.etag())
        .bind(cols.provider_upload_id)
        .bind(Json(cols.parts))
        .bind(cols.failure_reason)
        .bind(cols.started_at)
        .bind(cols.completed_at)
        .bind(cols.aborted_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = updated else {
            // Dropping the transaction rolls it back
            return Err(AppError::Conflict(format!(
                "upload session {} was modified concurrently (expected version {})",
                session.id(),
                session.version()
            )));
        };

        outbox::insert_in_tx(&mut tx, outbox).await?;
        tx.commit().await?;

        let mut saved = session.clone();
        saved.set_version(row.get("version"));
        Ok(saved)
    }

    async fn find_expirable(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<UploadSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM upload_sessions
            WHERE status IN ('preparing', 'active', 'in_progress') AND expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
            SESSION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }
}
