use missive_net::EnvelopeHash;
use missive_shared::application::ApplicationPayload;
use missive_shared::protocol::MessageType;
use missive_shared::raw_message::RawMessage;
use missive_shared::types::{MessageId, PublicKey};

use crate::datasync::DataSyncId;
use crate::encryption::ProtocolMessageSpec;

/// Published once per transport dispatch.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Absent for broadcasts.
    pub recipient: Option<PublicKey>,
    /// Absent when the encryption layer was skipped.
    pub spec: Option<ProtocolMessageSpec>,
    /// More than one when datasync batched several messages together.
    pub message_ids: Vec<MessageId>,
}

/// Published right before a message is handed to the transport.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub recipient: Option<PublicKey>,
    pub message: RawMessage,
}

/// One application message recovered from a received envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub envelope_hash: EnvelopeHash,
    /// Key that sealed the transport envelope.
    pub envelope_signer: PublicKey,
    /// Key that signed the application message.
    pub signer: PublicKey,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub parsed: Option<ApplicationPayload>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandledMessages {
    pub messages: Vec<ReceivedMessage>,
    /// Datasync acknowledgements carried by the envelope.
    pub acks: Vec<DataSyncId>,
}

impl HandledMessages {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.acks.is_empty()
    }
}
