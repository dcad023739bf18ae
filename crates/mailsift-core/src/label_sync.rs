use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LabelSyncError {
    #[error("label service unreachable: {0}")]
    Transport(String),
    #[error("label service rejected the change with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("label service rejected the credentials")]
    Unauthorized,
}

/// The remote side of a label change. Called once per message and action after
/// the local change has committed, with the full before/after label-id sets.
#[async_trait]
pub trait LabelSync: Send + Sync {
    async fn move_labels(
        &self,
        message_id: &str,
        from_label_ids: &[String],
        to_label_ids: &[String],
    ) -> Result<(), LabelSyncError>;
}

/// Keeps changes local. Used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLabelSync;

#[async_trait]
impl LabelSync for NoopLabelSync {
    async fn move_labels(
        &self,
        message_id: &str,
        from_label_ids: &[String],
        to_label_ids: &[String],
    ) -> Result<(), LabelSyncError> {
        debug!(
            message_id,
            from = ?from_label_ids,
            to = ?to_label_ids,
            "label sync disabled; skipping remote update"
        );
        Ok(())
    }
}
