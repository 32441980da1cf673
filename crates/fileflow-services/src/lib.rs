//! Fileflow services
//!
//! Coordinators that drive the domain aggregates against the store, object
//! storage and the work queues:
//!
//! - [`SessionManager`]: upload session lifecycle with idempotent init
//! - [`DownloadTaskService`] / [`DownloadExecutionCoordinator`]: remote fetches
//! - [`StorageEventReconciler`]: completion driven by storage notifications
//! - [`TransformRequestService`]: transform requests for stored assets
//! - [`handlers`]: the outbox handlers for each outbox kind
//!
//! Every write that triggers downstream work passes its outbox rows to the
//! store, and the rows are signalled to the dispatcher only after the write
//! returned.

pub mod download;
pub mod handlers;
pub mod reconciler;
pub mod session_manager;
pub mod transform;

pub use download::{
    DownloadExecutionCoordinator, DownloadOutcome, DownloadQueueHandler, DownloadTaskService,
    RequestDownload,
};
pub use handlers::{
    register_outbox_handlers, DownloadDispatchHandler, QueueForwardHandler, WebhookDeliveryHandler,
};
pub use reconciler::{
    parse_storage_event, ObjectCreatedEvent, ReconcileOutcome, ReconcilerConfig,
    StorageEventReconciler,
};
pub use session_manager::{
    CompletionOutcome, InitMultipartUpload, InitSingleUpload, SessionManager, SessionSettings,
};
pub use transform::TransformRequestService;

use fileflow_core::models::OutboxMessage;
use fileflow_core::{AppError, OutboxSignal};
use fileflow_storage::StorageError;

pub(crate) fn storage_error(err: StorageError) -> AppError {
    match err {
        StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
        other => AppError::external("object storage", other.to_string()),
    }
}

/// Hand freshly committed outbox rows to the fast path.
pub(crate) fn signal_committed(signal: &dyn OutboxSignal, messages: &[OutboxMessage]) {
    for message in messages {
        signal.message_committed(message.id);
    }
}
