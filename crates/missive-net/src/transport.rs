//! The seam between the message sender and whatever carries envelopes.

use async_trait::async_trait;
use thiserror::Error;

use missive_shared::error::IdentityError;
use missive_shared::identity::Identity;
use missive_shared::types::{MessageId, PublicKey};

use crate::envelope::{EnvelopeHash, NewMessage};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Swarm command channel closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope signature does not verify")]
    BadSignature,

    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Pairwise key agreed with `identity` by the encryption layer.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    pub identity: PublicKey,
    pub key: [u8; 32],
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("identity", &self.identity.short())
            .finish_non_exhaustive()
    }
}

/// Publishes envelopes under the addressing strategies the sender picks from.
///
/// Every send returns the hash of the envelope that went out.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_public(
        &self,
        message: &NewMessage,
        chat_name: &str,
    ) -> Result<EnvelopeHash, TransportError>;

    async fn send_private_with_partitioned(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError>;

    async fn send_private_with_shared_secret(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
        secret: &[u8; 32],
    ) -> Result<EnvelopeHash, TransportError>;

    async fn send_private_on_personal_topic(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError>;

    async fn send_community_message(
        &self,
        message: &NewMessage,
        community: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError>;

    /// Associate message IDs with an outgoing envelope. Calling it again for
    /// the same hash only adds IDs not already tracked.
    fn track(&self, message_ids: &[MessageId], hash: &EnvelopeHash, message: &NewMessage);

    /// Largest payload, in bytes, a single envelope may carry.
    fn max_message_size(&self) -> usize;

    async fn join_public(&self, chat_name: &str) -> Result<(), TransportError>;

    /// Start listening on the topics addressed to `key`.
    async fn load_key_filters(&self, key: &Identity) -> Result<(), TransportError>;

    /// Start listening on the topic of a newly agreed secret.
    async fn process_negotiated_secret(&self, secret: &SharedSecret) -> Result<(), TransportError>;
}
