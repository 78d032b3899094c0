//! [`Transport`] over the GossipSub swarm task.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use missive_shared::identity::Identity;
use missive_shared::types::{MessageId, PublicKey};

use crate::envelope::{EnvelopeHash, NewMessage, WireEnvelope};
use crate::monitor::EnvelopeMonitor;
use crate::swarm::SwarmCommand;
use crate::topics;
use crate::transport::{SharedSecret, Transport, TransportError};

/// Seals envelopes with the node identity and hands them to the swarm task.
pub struct GossipTransport {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    identity: Identity,
    max_message_size: usize,
    monitor: EnvelopeMonitor,
}

impl GossipTransport {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>, identity: Identity, max_message_size: usize) -> Self {
        Self {
            cmd_tx,
            identity,
            max_message_size,
            monitor: EnvelopeMonitor::new(),
        }
    }

    pub fn monitor(&self) -> &EnvelopeMonitor {
        &self.monitor
    }

    async fn publish(
        &self,
        message: &NewMessage,
        topic: String,
        dst: Option<PublicKey>,
    ) -> Result<EnvelopeHash, TransportError> {
        if message.payload.len() > self.max_message_size {
            return Err(TransportError::TooLarge {
                size: message.payload.len(),
                max: self.max_message_size,
            });
        }

        let wire = WireEnvelope::seal(&self.identity, message, &topic, dst)?.to_bytes()?;
        let hash = *blake3::hash(&wire).as_bytes();

        debug!(
            topic = %topic,
            len = wire.len(),
            hash = %hex::encode(&hash[..8]),
            "Publishing envelope"
        );
        self.cmd_tx
            .send(SwarmCommand::Publish { topic, data: wire })
            .await
            .map_err(|_| TransportError::Closed)?;

        Ok(hash)
    }

    async fn subscribe(&self, topic: String) -> Result<(), TransportError> {
        self.cmd_tx
            .send(SwarmCommand::Subscribe(topic))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for GossipTransport {
    async fn send_public(
        &self,
        message: &NewMessage,
        chat_name: &str,
    ) -> Result<EnvelopeHash, TransportError> {
        self.publish(message, topics::public_topic(chat_name), None).await
    }

    async fn send_private_with_partitioned(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.publish(message, topics::partitioned_topic(recipient), Some(*recipient))
            .await
    }

    async fn send_private_with_shared_secret(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
        secret: &[u8; 32],
    ) -> Result<EnvelopeHash, TransportError> {
        self.publish(message, topics::shared_secret_topic(secret), Some(*recipient))
            .await
    }

    async fn send_private_on_personal_topic(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.publish(message, topics::personal_topic(recipient), Some(*recipient))
            .await
    }

    async fn send_community_message(
        &self,
        message: &NewMessage,
        community: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.publish(message, topics::community_topic(community), None)
            .await
    }

    fn track(&self, message_ids: &[MessageId], hash: &EnvelopeHash, message: &NewMessage) {
        self.monitor.track(message_ids, hash, message.ttl);
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn join_public(&self, chat_name: &str) -> Result<(), TransportError> {
        self.subscribe(topics::public_topic(chat_name)).await
    }

    async fn load_key_filters(&self, key: &Identity) -> Result<(), TransportError> {
        let public = key.public_key();
        self.subscribe(topics::partitioned_topic(&public)).await?;
        self.subscribe(topics::personal_topic(&public)).await
    }

    async fn process_negotiated_secret(&self, secret: &SharedSecret) -> Result<(), TransportError> {
        self.subscribe(topics::shared_secret_topic(&secret.key)).await
    }
}
