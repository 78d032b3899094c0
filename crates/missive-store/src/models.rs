//! Records persisted by the store that have no counterpart in
//! `missive-shared`.

use missive_shared::types::{MessageId, PublicKey};
use serde::{Deserialize, Serialize};

/// One recipient's acknowledgement state for a reliably delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    /// Opaque batch identifier handed out by the reliable-delivery layer.
    pub datasync_id: Vec<u8>,
    pub message_id: MessageId,
    pub public_key: PublicKey,
    /// Unix seconds; zero while unconfirmed.
    pub confirmed_at: i64,
}

impl Confirmation {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at != 0
    }
}

/// An encrypted group message held back until its group key is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRatchetMessage {
    /// Hash of the transport envelope that carried it.
    pub hash: [u8; 32],
    pub group_id: Vec<u8>,
    pub sender: PublicKey,
    pub dst: Option<PublicKey>,
    /// Encryption-layer payload after segment reassembly.
    pub payload: Vec<u8>,
    pub timestamp: i64,
}
