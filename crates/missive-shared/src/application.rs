use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::group::MembershipUpdateEvent;
use crate::protocol::MessageType;

/// A text message in a one-to-one, group or community chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub clock: u64,
    pub timestamp: DateTime<Utc>,
    pub chat_id: String,
    pub text: String,
    /// Message ID this one replies to
    pub response_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmojiReaction {
    pub clock: u64,
    pub chat_id: String,
    pub message_id: String,
    pub emoji: String,
    pub retracted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditMessage {
    pub clock: u64,
    pub chat_id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteMessage {
    pub clock: u64,
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinMessage {
    pub clock: u64,
    pub chat_id: String,
    pub message_id: String,
    pub pinned: bool,
}

/// Announces a new device of the same account to its siblings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairInstallation {
    pub clock: u64,
    pub installation_id: String,
    pub device_type: String,
    pub name: String,
}

/// Content that may ride along with a membership update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEntity {
    Message(ChatMessage),
    EmojiReaction(EmojiReaction),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipUpdateMessage {
    pub chat_id: String,
    pub events: Vec<MembershipUpdateEvent>,
    pub chat_entity: Option<ChatEntity>,
}

/// Typed view of an application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationPayload {
    ChatMessage(ChatMessage),
    EmojiReaction(EmojiReaction),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    PinMessage(PinMessage),
    PairInstallation(PairInstallation),
    MembershipUpdate(MembershipUpdateMessage),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode `payload` according to `message_type`. Types without a typed
/// representation yield `None`.
pub fn parse_payload(
    message_type: MessageType,
    payload: &[u8],
) -> Result<Option<ApplicationPayload>, ProtocolError> {
    let parsed = match message_type {
        MessageType::ChatMessage => ApplicationPayload::ChatMessage(decode(payload)?),
        MessageType::EmojiReaction => ApplicationPayload::EmojiReaction(decode(payload)?),
        MessageType::EditMessage => ApplicationPayload::EditMessage(decode(payload)?),
        MessageType::DeleteMessage => ApplicationPayload::DeleteMessage(decode(payload)?),
        MessageType::PinMessage => ApplicationPayload::PinMessage(decode(payload)?),
        MessageType::PairInstallation => ApplicationPayload::PairInstallation(decode(payload)?),
        MessageType::MembershipUpdate => ApplicationPayload::MembershipUpdate(decode(payload)?),
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}
