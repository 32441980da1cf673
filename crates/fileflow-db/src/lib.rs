//! Fileflow persistence layer
//!
//! Store traits the services program against, PostgreSQL repositories that
//! implement them with `sqlx`, and an in-memory store for tests and local runs.
//!
//! Every write that must trigger downstream work takes the outbox rows as an
//! argument, so the adapter inserts them in the same transaction as the state
//! change.

pub mod db;
pub mod memory;
pub mod traits;

pub use db::{DownloadTaskRepository, OutboxRepository, UploadSessionRepository};
pub use memory::InMemoryStore;
pub use traits::{DownloadTaskStore, OutboxStore, SessionStore};
