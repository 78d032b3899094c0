use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MissiveError;
use crate::identity::Identity;
use crate::protocol::MessageType;
use crate::types::PublicKey;

/// How an outbound message is retried after its first dispatch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResendType {
    #[default]
    None,
    /// Handed to the reliable-delivery layer, which retries until acked.
    ReliableDelivery,
    /// Persisted and re-dispatched by the raw-message resend sweep.
    RawMessageRetry,
}

/// Which send entry point a resend goes through.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResendMethod {
    #[default]
    Dynamic,
    SendPrivate,
    SendCommunityMessage,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommunityKeyExMsgType {
    #[default]
    None,
    Reuse,
    Rekey,
}

macro_rules! int_codec {
    ($ty:ident { $($variant:ident = $n:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_i64(self) -> i64 {
                match self {
                    $($ty::$variant => $n,)+
                }
            }

            pub fn from_i64(value: i64) -> Option<Self> {
                match value {
                    $($n => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

int_codec!(ResendType { None = 0, ReliableDelivery = 1, RawMessageRetry = 2 });
int_codec!(ResendMethod { Dynamic = 0, SendPrivate = 1, SendCommunityMessage = 2 });
int_codec!(CommunityKeyExMsgType { None = 0, Reuse = 1, Rekey = 2 });

/// Hook run right before the transport call. Returning an error aborts the
/// dispatch.
pub type BeforeDispatch = Arc<dyn Fn(&mut RawMessage) -> Result<(), MissiveError> + Send + Sync>;

/// An outbound payload together with its delivery policy.
#[derive(Clone, Default)]
pub struct RawMessage {
    /// Hex message ID, assigned by the sender after wrapping.
    pub id: String,
    pub local_chat_id: String,
    pub resend_type: ResendType,
    pub resend_method: ResendMethod,
    pub skip_encryption_layer: bool,
    pub send_on_personal_topic: bool,
    pub ephemeral: bool,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    /// Overrides the node identity for signing and encryption.
    pub sender: Option<Identity>,
    pub recipients: Vec<PublicKey>,
    /// Unix millis of the last dispatch.
    pub last_sent: i64,
    pub send_count: u32,
    pub sent: bool,
    pub community_id: Option<Vec<u8>>,
    pub community_key_ex_msg_type: CommunityKeyExMsgType,
    pub pubsub_topic: Option<String>,
    pub hash_ratchet_group_id: Option<Vec<u8>>,
    pub before_dispatch: Option<BeforeDispatch>,
}

impl RawMessage {
    pub fn new(local_chat_id: impl Into<String>, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            local_chat_id: local_chat_id.into(),
            message_type,
            payload,
            ..Default::default()
        }
    }

    /// Apply the before-dispatch hook, if any.
    pub fn run_before_dispatch(&mut self) -> Result<(), MissiveError> {
        match self.before_dispatch.clone() {
            Some(hook) => hook(self),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessage")
            .field("id", &self.id)
            .field("local_chat_id", &self.local_chat_id)
            .field("resend_type", &self.resend_type)
            .field("resend_method", &self.resend_method)
            .field("skip_encryption_layer", &self.skip_encryption_layer)
            .field("send_on_personal_topic", &self.send_on_personal_topic)
            .field("ephemeral", &self.ephemeral)
            .field("message_type", &self.message_type)
            .field("payload_len", &self.payload.len())
            .field("sender", &self.sender)
            .field("recipients", &self.recipients.len())
            .field("send_count", &self.send_count)
            .field("sent", &self.sent)
            .field("community_key_ex_msg_type", &self.community_key_ex_msg_type)
            .field("pubsub_topic", &self.pubsub_topic)
            .field("before_dispatch", &self.before_dispatch.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_codec_roundtrip() {
        for t in [ResendType::None, ResendType::ReliableDelivery, ResendType::RawMessageRetry] {
            assert_eq!(ResendType::from_i64(t.as_i64()), Some(t));
        }
        assert_eq!(ResendMethod::from_i64(7), None);
        assert_eq!(
            CommunityKeyExMsgType::from_i64(2),
            Some(CommunityKeyExMsgType::Rekey)
        );
    }

    #[test]
    fn test_before_dispatch_can_mutate_and_abort() {
        let mut raw = RawMessage::new("chat", MessageType::ChatMessage, b"x".to_vec());
        raw.before_dispatch = Some(Arc::new(|m: &mut RawMessage| {
            m.payload.push(b'!');
            Ok(())
        }));
        raw.run_before_dispatch().unwrap();
        assert_eq!(raw.payload, b"x!");

        raw.before_dispatch = Some(Arc::new(|_: &mut RawMessage| {
            Err(MissiveError::DispatchAborted("nope".into()))
        }));
        assert!(raw.run_before_dispatch().is_err());
    }

    #[test]
    fn test_debug_hides_payload() {
        let raw = RawMessage::new("chat", MessageType::ChatMessage, b"secret".to_vec());
        let rendered = format!("{raw:?}");
        assert!(!rendered.contains("secret"));
    }
}
