//! Fileflow Core Library
//!
//! Domain models, error types, configuration and collaborator ports shared by
//! every Fileflow component. Nothing in here talks to a database, a queue or
//! object storage directly.

pub mod config;
pub mod error;
pub mod models;
pub mod ports;

// Re-export commonly used types
pub use config::{Config, FileFlowConfig, LogFormat};
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel, SessionError};
pub use ports::{
    FetchedResource, HttpFetcher, NoopOutboxSignal, NoopSessionCache, OutboxSignal,
    QueuePublisher, SessionCache, WebhookNotifier,
};
