//! Fast path: post-commit dispatch onto a bounded worker pool.
//!
//! Stores call [`OutboxSignal::message_committed`] after a transaction holding
//! outbox rows commits. The id goes onto a bounded channel; a dispatch loop
//! takes a worker permit and spawns the claim. A full channel only drops the
//! hint: the row is still PENDING and the sweeper picks it up after the grace
//! window.

use fileflow_core::OutboxSignal;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::OutboxExecutor;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            channel_capacity: 1024,
        }
    }
}

pub struct OutboxDispatcher {
    tx: mpsc::Sender<Uuid>,
    shutdown_tx: mpsc::Sender<()>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxDispatcher {
    /// Spawn the dispatch loop on the current runtime.
    pub fn start(executor: OutboxExecutor, config: DispatcherConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let semaphore = Arc::new(Semaphore::new(max_workers));

        let handle = tokio::spawn(Self::dispatch_loop(
            executor,
            rx,
            shutdown_rx,
            semaphore.clone(),
        ));

        tracing::info!(
            max_workers = max_workers,
            channel_capacity = config.channel_capacity,
            "Outbox dispatcher started"
        );

        Self {
            tx,
            shutdown_tx,
            semaphore,
            max_workers,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn dispatch_loop(
        executor: OutboxExecutor,
        mut rx: mpsc::Receiver<Uuid>,
        mut shutdown_rx: mpsc::Receiver<()>,
        semaphore: Arc<Semaphore>,
    ) {
        loop {
            // Queued ids are drained before a shutdown is honoured.
            let message_id = tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Some(id) => id,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let executor = executor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.claim_and_execute(message_id).await {
                    tracing::error!(
                        error = %e,
                        message_id = %message_id,
                        "Outbox dispatch failed; sweeper will retry"
                    );
                }
            });
        }

        tracing::info!("Outbox dispatcher loop stopped");
    }

    /// Stop accepting work and wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Outbox dispatcher loop panicked");
            }
        }
        match self.semaphore.acquire_many(self.max_workers as u32).await {
            Ok(_permits) => tracing::info!("Outbox dispatcher drained"),
            Err(e) => tracing::warn!(error = %e, "Outbox dispatcher semaphore closed"),
        }
    }
}

impl OutboxSignal for OutboxDispatcher {
    fn message_committed(&self, message_id: Uuid) {
        match self.tx.try_send(message_id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    message_id = %message_id,
                    "Dispatch channel full, leaving message to the sweeper"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(
                    message_id = %message_id,
                    "Dispatcher stopped, leaving message to the sweeper"
                );
            }
        }
    }
}
