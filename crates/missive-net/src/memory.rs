//! In-process [`Transport`] that records every call.
//!
//! Envelopes are sealed exactly as [`crate::gossip::GossipTransport`] seals
//! them, so recorded wire bytes can be fed to a receiving sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use missive_shared::identity::Identity;
use missive_shared::types::{MessageId, PublicKey};

use crate::envelope::{EnvelopeHash, NewMessage, WireEnvelope};
use crate::monitor::EnvelopeMonitor;
use crate::topics;
use crate::transport::{SharedSecret, Transport, TransportError};

/// Addressing strategy a recorded send went out with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendKind {
    Public(String),
    Partitioned(PublicKey),
    SharedSecret { recipient: PublicKey, secret: [u8; 32] },
    PersonalTopic(PublicKey),
    Community(PublicKey),
}

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub kind: SendKind,
    pub message: NewMessage,
    pub hash: EnvelopeHash,
    pub wire: Vec<u8>,
}

pub struct MemoryTransport {
    identity: Identity,
    max_message_size: usize,
    failing: AtomicBool,
    monitor: EnvelopeMonitor,
    sends: Mutex<Vec<RecordedSend>>,
    joined: Mutex<Vec<String>>,
    key_filters: Mutex<Vec<PublicKey>>,
    secrets: Mutex<Vec<SharedSecret>>,
}

impl MemoryTransport {
    pub fn new(identity: Identity, max_message_size: usize) -> Self {
        Self {
            identity,
            max_message_size,
            failing: AtomicBool::new(false),
            monitor: EnvelopeMonitor::new(),
            sends: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            key_filters: Mutex::new(Vec::new()),
            secrets: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent send fail with [`TransportError::Closed`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drain recorded sends.
    pub fn take_sends(&self) -> Vec<RecordedSend> {
        self.sends
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn key_filters(&self) -> Vec<PublicKey> {
        self.key_filters.lock().map(|k| k.clone()).unwrap_or_default()
    }

    pub fn negotiated_secrets(&self) -> Vec<SharedSecret> {
        self.secrets.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn monitor(&self) -> &EnvelopeMonitor {
        &self.monitor
    }

    fn record(
        &self,
        kind: SendKind,
        message: &NewMessage,
        topic: String,
        dst: Option<PublicKey>,
    ) -> Result<EnvelopeHash, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if message.payload.len() > self.max_message_size {
            return Err(TransportError::TooLarge {
                size: message.payload.len(),
                max: self.max_message_size,
            });
        }

        let wire = WireEnvelope::seal(&self.identity, message, &topic, dst)?.to_bytes()?;
        let hash = *blake3::hash(&wire).as_bytes();
        if let Ok(mut sends) = self.sends.lock() {
            sends.push(RecordedSend {
                kind,
                message: message.clone(),
                hash,
                wire,
            });
        }
        Ok(hash)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_public(
        &self,
        message: &NewMessage,
        chat_name: &str,
    ) -> Result<EnvelopeHash, TransportError> {
        self.record(
            SendKind::Public(chat_name.to_string()),
            message,
            topics::public_topic(chat_name),
            None,
        )
    }

    async fn send_private_with_partitioned(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.record(
            SendKind::Partitioned(*recipient),
            message,
            topics::partitioned_topic(recipient),
            Some(*recipient),
        )
    }

    async fn send_private_with_shared_secret(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
        secret: &[u8; 32],
    ) -> Result<EnvelopeHash, TransportError> {
        self.record(
            SendKind::SharedSecret {
                recipient: *recipient,
                secret: *secret,
            },
            message,
            topics::shared_secret_topic(secret),
            Some(*recipient),
        )
    }

    async fn send_private_on_personal_topic(
        &self,
        message: &NewMessage,
        recipient: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.record(
            SendKind::PersonalTopic(*recipient),
            message,
            topics::personal_topic(recipient),
            Some(*recipient),
        )
    }

    async fn send_community_message(
        &self,
        message: &NewMessage,
        community: &PublicKey,
    ) -> Result<EnvelopeHash, TransportError> {
        self.record(
            SendKind::Community(*community),
            message,
            topics::community_topic(community),
            None,
        )
    }

    fn track(&self, message_ids: &[MessageId], hash: &EnvelopeHash, message: &NewMessage) {
        self.monitor.track(message_ids, hash, message.ttl);
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn join_public(&self, chat_name: &str) -> Result<(), TransportError> {
        if let Ok(mut joined) = self.joined.lock() {
            joined.push(chat_name.to_string());
        }
        Ok(())
    }

    async fn load_key_filters(&self, key: &Identity) -> Result<(), TransportError> {
        if let Ok(mut filters) = self.key_filters.lock() {
            filters.push(key.public_key());
        }
        Ok(())
    }

    async fn process_negotiated_secret(&self, secret: &SharedSecret) -> Result<(), TransportError> {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.push(secret.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TransportMessage;

    #[tokio::test]
    async fn records_sends_with_parseable_wire() {
        let node = Identity::generate();
        let transport = MemoryTransport::new(node.clone(), 1024);
        let community = Identity::generate().public_key();

        let hash = transport
            .send_community_message(&NewMessage::new(b"x".to_vec()), &community)
            .await
            .unwrap();

        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].kind, SendKind::Community(community));
        assert_eq!(sends[0].hash, hash);

        let parsed = TransportMessage::parse(&sends[0].wire).unwrap();
        assert_eq!(parsed.sig_pub_key, node.public_key());
        assert_eq!(parsed.topic, topics::community_topic(&community));
    }

    #[tokio::test]
    async fn failing_transport_records_nothing() {
        let transport = MemoryTransport::new(Identity::generate(), 1024);
        transport.set_failing(true);

        let result = transport
            .send_public(&NewMessage::new(b"x".to_vec()), "status")
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(transport.sends().is_empty());
    }

    #[test]
    fn track_goes_through_monitor() {
        let transport = MemoryTransport::new(Identity::generate(), 1024);
        let id = MessageId([1u8; 32]);
        transport.track(&[id], &[2u8; 32], &NewMessage::new(vec![]));
        assert_eq!(transport.monitor().message_ids(&[2u8; 32]), vec![id]);
    }
}
