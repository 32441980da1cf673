//! Slow path: periodic re-drive of outbox rows the fast path missed.
//!
//! One sweep, in order:
//! 1. PROCESSING rows claimed longer ago than the staleness threshold are
//!    failed as abandoned claims (the attempt counts against the retry budget).
//! 2. FAILED rows with retries left go back to PENDING.
//! 3. PENDING rows older than the grace window are collected.
//! 4. Every collected id goes through the same conditional claim as the
//!    dispatcher, so a concurrent fast-path worker and the sweep never both run
//!    a row.

use chrono::{DateTime, Utc};
use fileflow_core::AppResult;
use fileflow_db::OutboxStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::{ExecutionOutcome, OutboxExecutor};
use crate::periodic::PeriodicTask;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub pending_grace: chrono::Duration,
    pub processing_stale: chrono::Duration,
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pending_grace: chrono::Duration::seconds(60),
            processing_stale: chrono::Duration::seconds(300),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub reclaimed_stale: u64,
    pub reset_failed: usize,
    pub processed: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

pub struct OutboxSweeper {
    store: Arc<dyn OutboxStore>,
    executor: OutboxExecutor,
    config: SweeperConfig,
}

impl OutboxSweeper {
    pub fn new(store: Arc<dyn OutboxStore>, executor: OutboxExecutor, config: SweeperConfig) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    pub async fn sweep_once(&self) -> AppResult<SweepStats> {
        self.sweep_once_at(Utc::now()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> AppResult<SweepStats> {
        let mut stats = SweepStats {
            reclaimed_stale: self
                .store
                .fail_stale_processing(now - self.config.processing_stale, self.config.batch_size)
                .await?,
            ..Default::default()
        };

        let reset = self
            .store
            .reset_failed(self.executor.max_retries(), self.config.batch_size)
            .await?;
        stats.reset_failed = reset.len();

        let pending = self
            .store
            .find_pending_before(now - self.config.pending_grace, self.config.batch_size)
            .await?;

        let mut seen = HashSet::new();
        for message_id in reset.into_iter().chain(pending) {
            if !seen.insert(message_id) {
                continue;
            }
            match self.executor.claim_and_execute(message_id).await {
                Ok(ExecutionOutcome::Processed) => stats.processed += 1,
                Ok(ExecutionOutcome::NotClaimed) => stats.skipped += 1,
                Ok(ExecutionOutcome::Failed { .. }) => stats.failed += 1,
                Ok(ExecutionOutcome::Exhausted { .. }) => stats.exhausted += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(error = %e, message_id = %message_id, "Sweep could not drive message");
                }
            }
        }

        if stats != SweepStats::default() {
            tracing::info!(
                reclaimed_stale = stats.reclaimed_stale,
                reset_failed = stats.reset_failed,
                processed = stats.processed,
                failed = stats.failed,
                exhausted = stats.exhausted,
                skipped = stats.skipped,
                "Outbox sweep finished"
            );
        }
        Ok(stats)
    }

    pub fn spawn(self: Arc<Self>) -> PeriodicTask {
        let interval = self.config.interval;
        PeriodicTask::spawn("outbox-sweeper", interval, move || {
            let sweeper = self.clone();
            async move {
                if let Err(e) = sweeper.sweep_once().await {
                    tracing::error!(error = %e, "Outbox sweep failed");
                }
            }
        })
    }
}
