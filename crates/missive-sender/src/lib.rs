//! # missive-sender
//!
//! The message-delivery pipeline: wrapping, encryption-layer selection,
//! reliable-delivery batching, segmentation, transport dispatch and the
//! receive-side counterpart. Collaborators sit behind traits so the node
//! binary and the tests can plug in their own.

pub mod config;
pub mod datasync;
pub mod encryption;
pub mod error;
pub mod events;
pub mod keystore;
pub mod path;
pub mod segmentation;
pub mod sender;
pub mod subscriptions;

pub use config::SenderConfig;
pub use datasync::{BatchingDataSync, DataSync, DataSyncBatch, DataSyncDispatcher, DataSyncId};
pub use encryption::{
    DecryptedMessage, EncryptionError, EncryptionProtocol, ProtocolMessageSpec, SealedBoxProtocol,
};
pub use error::SenderError;
pub use events::{HandledMessages, ReceivedMessage, ScheduledMessage, SentMessage};
pub use keystore::{EphemeralKeyStore, KeyStore};
pub use path::{DeliveryPath, Route};
pub use segmentation::SegmentationLayer;
pub use sender::{Collaborators, MessageSender, SharedSecretsHandler};
pub use subscriptions::Subscribers;
