pub mod download;
pub mod outbox;
pub mod session;

pub use download::DownloadTaskRepository;
pub use outbox::OutboxRepository;
pub use session::UploadSessionRepository;

/// Postgres unique_violation
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// Turn a text column into one of the domain enums
pub(crate) fn parse_column<T>(value: String, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    value
        .parse()
        .map_err(|e| sqlx::Error::Decode(format!("Failed to parse {}: {}", column, e).into()))
}
