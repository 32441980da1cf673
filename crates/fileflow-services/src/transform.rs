use fileflow_core::models::{OutboxMessage, TransformPayload};
use fileflow_core::{AppError, AppResult, OutboxSignal};
use fileflow_db::{DownloadTaskStore, OutboxStore};
use std::sync::Arc;
use uuid::Uuid;

use crate::signal_committed;

/// Records transform requests for stored assets as Transform outbox rows.
/// The row is the request: nothing else is written alongside it.
pub struct TransformRequestService {
    assets: Arc<dyn DownloadTaskStore>,
    outbox: Arc<dyn OutboxStore>,
    signal: Arc<dyn OutboxSignal>,
}

impl TransformRequestService {
    pub fn new(
        assets: Arc<dyn DownloadTaskStore>,
        outbox: Arc<dyn OutboxStore>,
        signal: Arc<dyn OutboxSignal>,
    ) -> Self {
        Self {
            assets,
            outbox,
            signal,
        }
    }

    /// Returns the request id. `operations` must be a non-empty JSON array.
    #[tracing::instrument(skip(self, operations))]
    pub async fn request_transform(
        &self,
        tenant_id: Uuid,
        file_asset_id: Uuid,
        operations: serde_json::Value,
    ) -> AppResult<Uuid> {
        if !operations.as_array().is_some_and(|ops| !ops.is_empty()) {
            return Err(AppError::InvalidInput(
                "operations must be a non-empty array".to_string(),
            ));
        }

        let asset = match self.assets.find_file_asset(file_asset_id).await? {
            Some(asset) if asset.tenant_id == tenant_id => asset,
            _ => return Err(AppError::NotFound(format!("file asset {}", file_asset_id))),
        };

        let request_id = Uuid::new_v4();
        let message = OutboxMessage::new(
            asset.id,
            &TransformPayload {
                request_id,
                tenant_id,
                file_asset_id: asset.id,
                bucket: asset.bucket,
                key: asset.key,
                operations,
            },
        )
        .map_err(|e| AppError::Internal(format!("Failed to encode transform payload: {}", e)))?;

        let outbox = [message];
        self.outbox.insert_messages(&outbox).await?;
        signal_committed(self.signal.as_ref(), &outbox);

        tracing::info!(request_id = %request_id, "Transform requested");
        Ok(request_id)
    }
}
