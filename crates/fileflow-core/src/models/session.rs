//! Upload session aggregate.
//!
//! A session is either a single presigned PUT or a provider multipart upload.
//! Every mutation goes through a transition that is checked against
//! [`SessionStatus::can_transition_to`]; a rejected transition leaves the
//! session untouched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Preparing,
    Active,
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            SessionStatus::Preparing | SessionStatus::Active | SessionStatus::InProgress => false,
            SessionStatus::Completed
            | SessionStatus::Failed
            | SessionStatus::Expired
            | SessionStatus::Cancelled => true,
        }
    }

    /// Allowed edges of the lifecycle graph. Status only moves forward: once a
    /// session leaves PREPARING or ACTIVE it can never return to them.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Preparing, Active) => true,
            (Active, InProgress) => true,
            (Active, Completed) | (InProgress, Completed) => true,
            (Preparing | Active | InProgress, Failed | Expired | Cancelled) => true,
            (Preparing, _) | (Active, _) | (InProgress, _) => false,
            (Completed, _) | (Failed, _) | (Expired, _) | (Cancelled, _) => false,
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SessionStatus::Preparing => write!(f, "preparing"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Expired => write!(f, "expired"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(SessionStatus::Preparing),
            "active" => Ok(SessionStatus::Active),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Private,
    Public,
}

impl Display for AccessType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AccessType::Private => write!(f, "private"),
            AccessType::Public => write!(f, "public"),
        }
    }
}

impl FromStr for AccessType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(AccessType::Private),
            "public" => Ok(AccessType::Public),
            _ => Err(anyhow::anyhow!("Invalid access type: {}", s)),
        }
    }
}

/// Where the uploaded object lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
    pub access_type: AccessType,
    pub file_name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Single,
    Multipart,
}

impl Display for SessionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SessionKind::Single => write!(f, "single"),
            SessionKind::Multipart => write!(f, "multipart"),
        }
    }
}

impl FromStr for SessionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(SessionKind::Single),
            "multipart" => Ok(SessionKind::Multipart),
            _ => Err(anyhow::anyhow!("Invalid session kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleUploadSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub target: UploadTarget,
    pub presigned_url: Option<String>,
    pub etag: Option<String>,
    /// Hex MD5 supplied by the client at init, compared against the stored object.
    pub expected_checksum: Option<String>,
    pub status: SessionStatus,
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartUploadSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub target: UploadTarget,
    pub provider_upload_id: Option<String>,
    pub part_size: i64,
    pub total_parts: i32,
    /// Sorted by part number, at most one entry per number.
    pub parts: Vec<CompletedPart>,
    pub status: SessionStatus,
    pub idempotency_key: Option<String>,
    pub etag: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub aborted_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadSession {
    Single(SingleUploadSession),
    Multipart(MultipartUploadSession),
}

fn invalid(from: SessionStatus, to: SessionStatus) -> SessionError {
    SessionError::InvalidTransition { from, to }
}

fn guard(from: SessionStatus, to: SessionStatus) -> Result<(), SessionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(invalid(from, to))
    }
}

impl SingleUploadSession {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// PREPARING -> ACTIVE once a presigned URL has been minted.
    pub fn activate(&mut self, presigned_url: String) -> Result<(), SessionError> {
        guard(self.status, SessionStatus::Active)?;
        self.presigned_url = Some(presigned_url);
        self.status = SessionStatus::Active;
        Ok(())
    }

    pub fn complete(&mut self, etag: Option<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.status != SessionStatus::Active {
            return Err(invalid(self.status, SessionStatus::Completed));
        }
        let etag = etag
            .filter(|e| !e.is_empty())
            .or_else(|| self.etag.clone())
            .ok_or(SessionError::MissingETag)?;
        self.etag = Some(etag);
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }
}

impl MultipartUploadSession {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// PREPARING -> ACTIVE once the provider has issued an upload id.
    pub fn activate(
        &mut self,
        provider_upload_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        guard(self.status, SessionStatus::Active)?;
        self.provider_upload_id = Some(provider_upload_id);
        self.status = SessionStatus::Active;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record a part. The first part moves an ACTIVE session to IN_PROGRESS;
    /// re-marking a part number replaces the earlier record.
    pub fn mark_part_uploaded(
        &mut self,
        part_number: i32,
        etag: String,
        size: i64,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::InProgress => {}
            SessionStatus::Active => guard(self.status, SessionStatus::InProgress)?,
            other => return Err(invalid(other, SessionStatus::InProgress)),
        }
        if part_number < 1 || part_number > self.total_parts {
            return Err(SessionError::InvalidPartNumber {
                part_number,
                total_parts: self.total_parts,
            });
        }
        if etag.is_empty() {
            return Err(SessionError::MissingETag);
        }

        let part = CompletedPart {
            part_number,
            etag,
            size,
            uploaded_at: now,
        };
        match self
            .parts
            .binary_search_by_key(&part_number, |p| p.part_number)
        {
            Ok(idx) => self.parts[idx] = part,
            Err(idx) => self.parts.insert(idx, part),
        }
        self.status = SessionStatus::InProgress;
        Ok(())
    }

    /// Part numbers must be exactly `1..=total_parts`.
    pub fn verify_parts(&self) -> Result<(), SessionError> {
        let recorded: BTreeSet<i32> = self.parts.iter().map(|p| p.part_number).collect();
        let expected: BTreeSet<i32> = (1..=self.total_parts).collect();
        if recorded == expected {
            return Ok(());
        }
        Err(SessionError::MissingParts {
            total_parts: self.total_parts,
            missing: expected.difference(&recorded).copied().collect(),
            unexpected: recorded.difference(&expected).copied().collect(),
        })
    }

    pub fn complete(&mut self, etag: Option<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        guard(self.status, SessionStatus::Completed)?;
        self.verify_parts()?;
        if etag.is_some() {
            self.etag = etag;
        }
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }
}

impl UploadSession {
    pub fn for_new_single(
        tenant_id: Uuid,
        target: UploadTarget,
        idempotency_key: String,
        ttl: Duration,
        expected_checksum: Option<String>,
    ) -> Self {
        let now = Utc::now();
        UploadSession::Single(SingleUploadSession {
            id: Uuid::new_v4(),
            tenant_id,
            target,
            presigned_url: None,
            etag: None,
            expected_checksum,
            status: SessionStatus::Preparing,
            idempotency_key,
            expires_at: now + ttl,
            created_at: now,
            completed_at: None,
            failure_reason: None,
            version: 0,
        })
    }

    pub fn for_new_multipart(
        tenant_id: Uuid,
        target: UploadTarget,
        part_size: i64,
        total_parts: i32,
        idempotency_key: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        UploadSession::Multipart(MultipartUploadSession {
            id: Uuid::new_v4(),
            tenant_id,
            target,
            provider_upload_id: None,
            part_size,
            total_parts,
            parts: Vec::new(),
            status: SessionStatus::Preparing,
            idempotency_key,
            etag: None,
            expires_at: now + ttl,
            created_at: now,
            started_at: None,
            completed_at: None,
            aborted_at: None,
            failure_reason: None,
            version: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        match self {
            UploadSession::Single(s) => s.id,
            UploadSession::Multipart(m) => m.id,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            UploadSession::Single(s) => s.tenant_id,
            UploadSession::Multipart(m) => m.tenant_id,
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            UploadSession::Single(_) => SessionKind::Single,
            UploadSession::Multipart(_) => SessionKind::Multipart,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            UploadSession::Single(s) => s.status,
            UploadSession::Multipart(m) => m.status,
        }
    }

    pub fn target(&self) -> &UploadTarget {
        match self {
            UploadSession::Single(s) => &s.target,
            UploadSession::Multipart(m) => &m.target,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            UploadSession::Single(s) => s.etag.as_deref(),
            UploadSession::Multipart(m) => m.etag.as_deref(),
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            UploadSession::Single(s) => Some(s.idempotency_key.as_str()),
            UploadSession::Multipart(m) => m.idempotency_key.as_deref(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            UploadSession::Single(s) => s.expires_at,
            UploadSession::Multipart(m) => m.expires_at,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            UploadSession::Single(s) => s.version,
            UploadSession::Multipart(m) => m.version,
        }
    }

    /// Only the persistence layer bumps the version, after a successful write.
    pub fn set_version(&mut self, version: i64) {
        match self {
            UploadSession::Single(s) => s.version = version,
            UploadSession::Multipart(m) => m.version = version,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    fn status_mut(&mut self) -> &mut SessionStatus {
        match self {
            UploadSession::Single(s) => &mut s.status,
            UploadSession::Multipart(m) => &mut m.status,
        }
    }

    pub fn mark_part_uploaded(
        &mut self,
        part_number: i32,
        etag: String,
        size: i64,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        match self {
            UploadSession::Single(_) => Err(SessionError::UnsupportedOperation("single")),
            UploadSession::Multipart(m) => m.mark_part_uploaded(part_number, etag, size, now),
        }
    }

    pub fn complete(&mut self, etag: Option<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self {
            UploadSession::Single(s) => s.complete(etag, now),
            UploadSession::Multipart(m) => m.complete(etag, now),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), SessionError> {
        guard(self.status(), SessionStatus::Failed)?;
        *self.status_mut() = SessionStatus::Failed;
        let reason = Some(reason.into());
        match self {
            UploadSession::Single(s) => s.failure_reason = reason,
            UploadSession::Multipart(m) => m.failure_reason = reason,
        }
        Ok(())
    }

    /// Expire a non-terminal session whose deadline has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        guard(self.status(), SessionStatus::Expired)?;
        if !self.is_expired_at(now) {
            return Err(SessionError::NotExpired);
        }
        *self.status_mut() = SessionStatus::Expired;
        if let UploadSession::Multipart(m) = self {
            m.aborted_at = Some(now);
        }
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        guard(self.status(), SessionStatus::Cancelled)?;
        *self.status_mut() = SessionStatus::Cancelled;
        if let UploadSession::Multipart(m) = self {
            m.aborted_at = Some(now);
        }
        Ok(())
    }
}
