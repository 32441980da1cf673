//! Claim-then-execute for a single outbox row
//!
//! Shared by the fast path (dispatcher) and the slow path (sweeper). The
//! conditional claim is the only ownership check: whoever moves the row from
//! PENDING to PROCESSING runs the handler, everyone else backs off.

use chrono::Utc;
use fileflow_core::models::OutboxMessage;
use fileflow_core::{AppError, AppResult};
use fileflow_db::OutboxStore;
use std::sync::Arc;
use uuid::Uuid;

use crate::handler::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Processed,
    /// Another worker owns the row, or it is no longer PENDING.
    NotClaimed,
    /// Recorded as FAILED; the sweeper will retry it.
    Failed { retry_count: i32 },
    /// Recorded as FAILED with no retries left.
    Exhausted { retry_count: i32 },
}

#[derive(Clone)]
pub struct OutboxExecutor {
    store: Arc<dyn OutboxStore>,
    handlers: HandlerRegistry,
    max_retries: i32,
}

impl OutboxExecutor {
    pub fn new(store: Arc<dyn OutboxStore>, handlers: HandlerRegistry, max_retries: i32) -> Self {
        Self {
            store,
            handlers,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    #[tracing::instrument(skip(self), fields(message_id = %message_id))]
    pub async fn claim_and_execute(&self, message_id: Uuid) -> AppResult<ExecutionOutcome> {
        let Some(message) = self.store.try_claim(message_id, Utc::now()).await? else {
            tracing::debug!("Outbox message not claimable, skipping");
            return Ok(ExecutionOutcome::NotClaimed);
        };

        let start = std::time::Instant::now();
        match self.run_handler(&message).await {
            Ok(()) => {
                if !self.store.mark_processed(message.id, Utc::now()).await? {
                    tracing::warn!(
                        kind = %message.kind,
                        "Outbox message left PROCESSING before completion was recorded"
                    );
                }
                tracing::info!(
                    kind = %message.kind,
                    aggregate_id = %message.aggregate_id,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Outbox message processed"
                );
                Ok(ExecutionOutcome::Processed)
            }
            Err(e) => self.record_failure(&message, e).await,
        }
    }

    async fn run_handler(&self, message: &OutboxMessage) -> AppResult<()> {
        let handler = self.handlers.get(message.kind).ok_or_else(|| {
            AppError::Internal(format!("No handler registered for outbox kind {}", message.kind))
        })?;
        handler
            .handle(message)
            .await
            .map_err(|e| e.normalize("outbox handler"))
    }

    async fn record_failure(
        &self,
        message: &OutboxMessage,
        error: AppError,
    ) -> AppResult<ExecutionOutcome> {
        let Some(failed) = self.store.mark_failed(message.id, &error.to_string()).await? else {
            tracing::warn!(
                error = %error,
                kind = %message.kind,
                "Outbox message failed but was no longer PROCESSING"
            );
            return Ok(ExecutionOutcome::NotClaimed);
        };

        if failed.retry_count >= self.max_retries {
            let exhausted = AppError::ExhaustedRetry {
                entity: "outbox message",
                id: failed.id,
                attempts: failed.retry_count,
                last_error: error.to_string(),
            };
            tracing::error!(
                error = %exhausted,
                kind = %failed.kind,
                aggregate_id = %failed.aggregate_id,
                "Outbox message permanently failed"
            );
            Ok(ExecutionOutcome::Exhausted {
                retry_count: failed.retry_count,
            })
        } else {
            tracing::warn!(
                error = %error,
                kind = %failed.kind,
                retry_count = failed.retry_count,
                max_retries = self.max_retries,
                "Outbox message failed, will be retried by the sweeper"
            );
            Ok(ExecutionOutcome::Failed {
                retry_count: failed.retry_count,
            })
        }
    }
}
