//! Fileflow background workers
//!
//! - [`OutboxDispatcher`]: post-commit fast path on a bounded worker pool
//! - [`OutboxSweeper`]: periodic slow path for stuck, failed and abandoned rows
//! - [`SessionExpirationSweeper`]: periodic expiration of overdue upload sessions
//!
//! Dispatcher and sweeper share [`OutboxExecutor`], whose conditional claim is
//! what keeps the two paths from running the same row twice.

pub mod dispatcher;
pub mod executor;
pub mod expiration;
pub mod handler;
pub mod periodic;
pub mod sweeper;

pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use executor::{ExecutionOutcome, OutboxExecutor};
pub use expiration::{ExpirationStats, SessionExpirationSweeper};
pub use handler::{HandlerRegistry, OutboxHandler};
pub use periodic::PeriodicTask;
pub use sweeper::{OutboxSweeper, SweepStats, SweeperConfig};
