use thiserror::Error;

use missive_net::TransportError;
use missive_shared::error::{IdentityError, MissiveError, ProtocolError, SegmentationError};
use missive_store::StoreError;

use crate::datasync::DataSyncError;
use crate::encryption::EncryptionError;

/// Errors surfaced by the send path, each tagged with the stage that failed.
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to wrap message: {0}")]
    Wrap(#[from] ProtocolError),

    #[error("Failed to encrypt message: {0}")]
    Encrypt(#[from] EncryptionError),

    #[error("Failed to send message: {0}")]
    Send(#[from] TransportError),

    #[error("Failed to hand message to datasync: {0}")]
    DataSync(#[from] DataSyncError),

    #[error("Invalid message configuration: {0}")]
    Configuration(String),

    #[error("Dispatch aborted: {0}")]
    BeforeDispatch(#[source] MissiveError),

    #[error("Shared secret handler failed: {0}")]
    SharedSecrets(#[source] MissiveError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Segmentation error: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("Failed to handle transport layer message: {0}")]
    TransportParse(#[source] TransportError),

    #[error("Invalid key: {0}")]
    Identity(#[from] IdentityError),
}

impl SenderError {
    /// Segmentation outcomes that just mean "nothing to deliver yet".
    pub fn is_segmentation_pending(&self) -> bool {
        matches!(
            self,
            SenderError::Segmentation(
                SegmentationError::Incomplete | SegmentationError::AlreadyCompleted
            )
        )
    }
}
