//! The signed envelope every payload travels in on the pub/sub network.

use serde::{Deserialize, Serialize};

use missive_shared::constants::{calculate_pow, ENVELOPE_TTL, POW_TIME};
use missive_shared::identity::{verify_signature, Identity};
use missive_shared::types::PublicKey;

use crate::transport::TransportError;

/// BLAKE3 of a serialized envelope.
pub type EnvelopeHash = [u8; 32];

/// An outbound payload with its delivery parameters, before addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub ttl: u32,
    pub payload: Vec<u8>,
    pub pow_target: f64,
    pub pow_time: u32,
    pub pubsub_topic: Option<String>,
    pub ephemeral: bool,
}

impl NewMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            ttl: ENVELOPE_TTL,
            pow_target: calculate_pow(&payload),
            pow_time: POW_TIME,
            payload,
            pubsub_topic: None,
            ephemeral: false,
        }
    }

    pub fn with_pubsub_topic(mut self, pubsub_topic: Option<String>) -> Self {
        self.pubsub_topic = pubsub_topic;
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct EnvelopeBody {
    ttl: u32,
    pow_target: f64,
    pow_time: u32,
    ephemeral: bool,
    pubsub_topic: Option<String>,
    topic: String,
    dst: Option<PublicKey>,
    /// Unix millis at sealing time
    timestamp: i64,
    payload: Vec<u8>,
}

/// Envelope as serialized on the wire, signed by the sending node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    body: EnvelopeBody,
    sig: PublicKey,
    signature: Vec<u8>,
}

fn body_digest(body: &EnvelopeBody) -> Result<[u8; 32], TransportError> {
    let bytes =
        bincode::serialize(body).map_err(|e| TransportError::Serialization(e.to_string()))?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

impl WireEnvelope {
    pub fn seal(
        identity: &Identity,
        message: &NewMessage,
        topic: &str,
        dst: Option<PublicKey>,
    ) -> Result<Self, TransportError> {
        let body = EnvelopeBody {
            ttl: message.ttl,
            pow_target: message.pow_target,
            pow_time: message.pow_time,
            ephemeral: message.ephemeral,
            pubsub_topic: message.pubsub_topic.clone(),
            topic: topic.to_string(),
            dst,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload: message.payload.clone(),
        };
        let signature = identity.sign(&body_digest(&body)?);

        Ok(Self {
            body,
            sig: identity.public_key(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(data).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn topic(&self) -> &str {
        &self.body.topic
    }
}

/// A received envelope whose signature checked out.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub hash: EnvelopeHash,
    /// Key of the node that sealed the envelope.
    pub sig_pub_key: PublicKey,
    pub dst: Option<PublicKey>,
    pub topic: String,
    pub timestamp: i64,
    pub ttl: u32,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    /// Decode and authenticate raw wire bytes.
    pub fn parse(wire: &[u8]) -> Result<Self, TransportError> {
        let envelope = WireEnvelope::from_bytes(wire)?;
        verify_signature(
            &envelope.sig,
            &body_digest(&envelope.body)?,
            &envelope.signature,
        )
        .map_err(|_| TransportError::BadSignature)?;

        Ok(Self {
            hash: *blake3::hash(wire).as_bytes(),
            sig_pub_key: envelope.sig,
            dst: envelope.body.dst,
            topic: envelope.body.topic,
            timestamp: envelope.body.timestamp,
            ttl: envelope.body.ttl,
            payload: envelope.body.payload,
        })
    }
}
