use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{verify_signature, Identity};
use crate::types::{MessageId, PublicKey};

/// Application-level message tags carried in the metadata layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    #[default]
    Unknown = 0,
    ChatMessage = 1,
    ContactUpdate = 2,
    MembershipUpdate = 3,
    PairInstallation = 4,
    ContactRequest = 5,
    EmojiReaction = 6,
    EditMessage = 7,
    DeleteMessage = 8,
    PinMessage = 9,
    CommunityDescription = 10,
    CommunityRequestToJoin = 11,
    CommunityEncryptionKeys = 12,
    SyncInstallation = 13,
    StatusUpdate = 14,
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Community messages of these types are encrypted with the group's
    /// hash-ratchet key and published on the chat topic.
    pub fn is_community_encrypted(self) -> bool {
        matches!(
            self,
            MessageType::ChatMessage
                | MessageType::EditMessage
                | MessageType::DeleteMessage
                | MessageType::PinMessage
                | MessageType::EmojiReaction
        )
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let t = match value {
            0 => MessageType::Unknown,
            1 => MessageType::ChatMessage,
            2 => MessageType::ContactUpdate,
            3 => MessageType::MembershipUpdate,
            4 => MessageType::PairInstallation,
            5 => MessageType::ContactRequest,
            6 => MessageType::EmojiReaction,
            7 => MessageType::EditMessage,
            8 => MessageType::DeleteMessage,
            9 => MessageType::PinMessage,
            10 => MessageType::CommunityDescription,
            11 => MessageType::CommunityRequestToJoin,
            12 => MessageType::CommunityEncryptionKeys,
            13 => MessageType::SyncInstallation,
            14 => MessageType::StatusUpdate,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(t)
    }
}

/// The wrapping layer: payload stamped with its type and signed by the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationMetadataMessage {
    pub signer: PublicKey,
    pub signature: Vec<u8>,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

fn signing_digest(message_type: MessageType, payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&message_type.as_u32().to_le_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

impl ApplicationMetadataMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Sign and serialize `payload`. Output is a pure function of its inputs, so
/// the derived message ID is stable across retries.
pub fn wrap(
    identity: &Identity,
    message_type: MessageType,
    payload: &[u8],
) -> Result<(Vec<u8>, MessageId), ProtocolError> {
    let signature = identity.sign(&signing_digest(message_type, payload));
    let message = ApplicationMetadataMessage {
        signer: identity.public_key(),
        signature: signature.to_bytes().to_vec(),
        message_type,
        payload: payload.to_vec(),
    };

    let wrapped = message
        .to_bytes()
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let id = MessageId::compute(&message.signer, &wrapped);
    Ok((wrapped, id))
}

/// Parse and verify a wrapped payload, returning it with its message ID.
pub fn unwrap(wrapped: &[u8]) -> Result<(ApplicationMetadataMessage, MessageId), ProtocolError> {
    let message = ApplicationMetadataMessage::from_bytes(wrapped)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    verify_signature(
        &message.signer,
        &signing_digest(message.message_type, &message.payload),
        &message.signature,
    )
    .map_err(|_| ProtocolError::BadSignature)?;

    let id = MessageId::compute(&message.signer, wrapped);
    Ok((message, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_is_deterministic() {
        let id = Identity::generate();
        let (w1, id1) = wrap(&id, MessageType::ChatMessage, b"hello").unwrap();
        let (w2, id2) = wrap(&id, MessageType::ChatMessage, b"hello").unwrap();
        assert_eq!(w1, w2);
        assert_eq!(id1, id2);

        let (_, other) = wrap(&id, MessageType::EmojiReaction, b"hello").unwrap();
        assert_ne!(id1, other);
    }

    #[test]
    fn test_unwrap_recovers_id_and_signer() {
        let id = Identity::generate();
        let (wrapped, message_id) = wrap(&id, MessageType::PinMessage, b"pin").unwrap();

        let (message, unwrapped_id) = unwrap(&wrapped).unwrap();
        assert_eq!(unwrapped_id, message_id);
        assert_eq!(message.signer, id.public_key());
        assert_eq!(message.message_type, MessageType::PinMessage);
        assert_eq!(message.payload, b"pin");
    }

    #[test]
    fn test_unwrap_rejects_tampered_payload() {
        let id = Identity::generate();
        let (wrapped, _) = wrap(&id, MessageType::ChatMessage, b"original").unwrap();

        let mut message = ApplicationMetadataMessage::from_bytes(&wrapped).unwrap();
        message.payload = b"forged".to_vec();
        let forged = message.to_bytes().unwrap();

        assert!(matches!(unwrap(&forged), Err(ProtocolError::BadSignature)));
    }

    #[test]
    fn test_unwrap_rejects_garbage() {
        assert!(matches!(
            unwrap(&[1, 2, 3]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_message_type_u32_roundtrip() {
        for t in [MessageType::ChatMessage, MessageType::SyncInstallation] {
            assert_eq!(MessageType::try_from(t.as_u32()).unwrap(), t);
        }
        assert!(MessageType::try_from(999).is_err());
        assert!(MessageType::EditMessage.is_community_encrypted());
        assert!(!MessageType::CommunityDescription.is_community_encrypted());
    }
}
