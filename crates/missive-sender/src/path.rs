//! Delivery path selection and transport addressing.

use missive_net::SharedSecret;
use missive_shared::raw_message::{RawMessage, ResendType};
use missive_shared::types::PublicKey;

use crate::encryption::ProtocolMessageSpec;
use crate::error::SenderError;

/// How a private message travels once it is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Appended to the datasync batcher, which encrypts and sends later.
    ReliableDelivery,
    /// Wrapped bytes go out as-is on the partitioned topic.
    SkipEncryption,
    /// Wrapped bytes go out as-is on the recipient's personal topic.
    PersonalTopic,
    /// Encrypted for the recipient by the encryption layer.
    Encrypted,
}

impl DeliveryPath {
    /// Pick the path for `raw`, rejecting flag combinations datasync cannot
    /// honour.
    pub fn select(raw: &RawMessage, datasync_enabled: bool) -> Result<Self, SenderError> {
        if raw.resend_type == ResendType::ReliableDelivery {
            if raw.sender.is_some() {
                return Err(SenderError::Configuration(
                    "reliable delivery cannot be used with a sender override".into(),
                ));
            }
            if raw.skip_encryption_layer {
                return Err(SenderError::Configuration(
                    "reliable delivery requires the encryption layer".into(),
                ));
            }
            if raw.send_on_personal_topic {
                return Err(SenderError::Configuration(
                    "reliable delivery cannot be sent on a personal topic".into(),
                ));
            }
            if datasync_enabled {
                return Ok(DeliveryPath::ReliableDelivery);
            }
        }

        Ok(match (raw.skip_encryption_layer, raw.send_on_personal_topic) {
            (true, true) => DeliveryPath::PersonalTopic,
            (true, false) => DeliveryPath::SkipEncryption,
            (false, _) => DeliveryPath::Encrypted,
        })
    }
}

/// Where an envelope is published.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Public(String),
    Partitioned(PublicKey),
    SharedSecret {
        recipient: PublicKey,
        secret: SharedSecret,
    },
    PersonalTopic(PublicKey),
    Community(PublicKey),
}

impl Route {
    /// The shared-secret topic once both sides agreed on the secret, the
    /// partitioned topic before that.
    pub fn for_spec(recipient: PublicKey, spec: &ProtocolMessageSpec) -> Self {
        match &spec.shared_secret {
            Some(secret) if spec.agreed_secret => Route::SharedSecret {
                recipient,
                secret: secret.clone(),
            },
            _ => Route::Partitioned(recipient),
        }
    }

    pub fn recipient(&self) -> Option<PublicKey> {
        match self {
            Route::Public(_) | Route::Community(_) => None,
            Route::Partitioned(recipient)
            | Route::PersonalTopic(recipient)
            | Route::SharedSecret { recipient, .. } => Some(*recipient),
        }
    }
}
