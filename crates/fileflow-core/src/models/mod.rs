pub mod download;
pub mod file_asset;
pub mod outbox;
pub mod session;

pub use download::{
    DownloadDestination, DownloadQueueMessage, DownloadStatus, DownloadTask, FailureDisposition,
};
pub use file_asset::{AssetOrigin, FileAsset};
pub use outbox::{
    DownloadPayload, OutboxKind, OutboxMessage, OutboxPayload, OutboxStatus, PipelinePayload,
    TransformPayload, WebhookPayload,
};
pub use session::{
    AccessType, CompletedPart, MultipartUploadSession, SessionKind, SessionStatus,
    SingleUploadSession, UploadSession, UploadTarget,
};
