//! The encryption-layer seam and a sealed-box reference protocol.
//!
//! The sender never builds ciphertext itself: it asks an
//! [`EncryptionProtocol`] for a [`ProtocolMessageSpec`] and ships the bytes.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use missive_net::SharedSecret;
use missive_shared::crypto::{self, SymmetricKey};
use missive_shared::error::{CryptoError, IdentityError};
use missive_shared::identity::Identity;
use missive_shared::types::PublicKey;

/// Minimum spacing between two bundle advertisements to the same peer.
const BUNDLE_ADVERTISE_INTERVAL_SECS: i64 = 6 * 60 * 60;

const ENCRYPTION_MAGIC: &[u8; 4] = b"MENC";

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Payload is not an encryption-layer message")]
    NotEncrypted,

    #[error("Message from {0} was not encrypted for this device")]
    DeviceNotFound(PublicKey),

    #[error("Unknown hash ratchet group {}", hex::encode(.0))]
    GroupNotFound(Vec<u8>),

    #[error("Malformed encryption-layer message: {0}")]
    Malformed(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// What the encryption layer produced for one outbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessageSpec {
    /// Serialized encryption-layer message, ready to become an envelope payload.
    pub message: Vec<u8>,
    /// Secret negotiated with the recipient, if any.
    pub shared_secret: Option<SharedSecret>,
    /// Whether the recipient is known to hold `shared_secret` too, so the
    /// secret's private topic can be used.
    pub agreed_secret: bool,
}

impl ProtocolMessageSpec {
    fn plain(message: Vec<u8>) -> Self {
        Self {
            message,
            shared_secret: None,
            agreed_secret: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecryptedMessage {
    /// `None` for protocol-only messages (bundles, group keys).
    pub payload: Option<Vec<u8>>,
    /// Secrets negotiated while handling this message.
    pub shared_secrets: Vec<SharedSecret>,
    /// Hash ratchet groups whose key this message installed.
    pub installed_groups: Vec<Vec<u8>>,
}

pub trait EncryptionProtocol: Send + Sync {
    fn build_direct_message(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError>;

    fn build_public_message(
        &self,
        sender: &Identity,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError>;

    /// One-off message encrypted to `recipient` without any session state.
    fn build_dh_message(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError>;

    fn build_bundle_advertise_message(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
    ) -> Result<ProtocolMessageSpec, EncryptionError>;

    fn build_hash_ratchet_message(
        &self,
        group_id: &[u8],
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError>;

    /// One spec per recipient, in `recipients` order, distributing the group
    /// key. `rekey` forces a fresh key.
    fn key_exchange_message_specs(
        &self,
        group_id: &[u8],
        sender: &Identity,
        recipients: &[PublicKey],
        rekey: bool,
    ) -> Result<Vec<ProtocolMessageSpec>, EncryptionError>;

    /// Decrypt with `receiver`. With `skip_negotiation` no session state is
    /// recorded and no secret is negotiated.
    fn handle_message(
        &self,
        receiver: &Identity,
        payload: &[u8],
        skip_negotiation: bool,
    ) -> Result<DecryptedMessage, EncryptionError>;

    fn should_advertise_bundle(&self, peer: &PublicKey, now: i64) -> Result<bool, EncryptionError>;

    fn confirm_bundle_advertisement(&self, peer: &PublicKey, now: i64);
}

#[derive(Debug, Serialize, Deserialize)]
enum SealedEnvelope {
    Public {
        payload: Vec<u8>,
    },
    Direct {
        sender: PublicKey,
        device: PublicKey,
        ciphertext: Vec<u8>,
    },
    Dh {
        ephemeral: PublicKey,
        device: PublicKey,
        ciphertext: Vec<u8>,
    },
    HashRatchet {
        group_id: Vec<u8>,
        ciphertext: Vec<u8>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum DirectBody {
    Payload(Vec<u8>),
    Bundle,
    GroupKey { group_id: Vec<u8>, key: SymmetricKey },
}

fn encode_envelope(envelope: &SealedEnvelope) -> Result<Vec<u8>, EncryptionError> {
    let body = bincode::serialize(envelope).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(ENCRYPTION_MAGIC.len() + body.len());
    out.extend_from_slice(ENCRYPTION_MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_envelope(data: &[u8]) -> Result<SealedEnvelope, EncryptionError> {
    let body = data
        .strip_prefix(ENCRYPTION_MAGIC.as_slice())
        .ok_or(EncryptionError::NotEncrypted)?;
    bincode::deserialize(body).map_err(|e| EncryptionError::Malformed(e.to_string()))
}

/// Pairwise X25519 agreement plus XChaCha20-Poly1305.
///
/// A peer counts as having a session once any direct message from it has
/// been decrypted; until then outbound secrets are not considered agreed and
/// messages go out on the partitioned topic.
#[derive(Debug, Default)]
pub struct SealedBoxProtocol {
    sessions: RwLock<HashSet<PublicKey>>,
    advertised: RwLock<HashMap<PublicKey, i64>>,
    group_keys: RwLock<HashMap<Vec<u8>, SymmetricKey>>,
}

impl SealedBoxProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self, peer: &PublicKey) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    pub fn has_group_key(&self, group_id: &[u8]) -> bool {
        self.group_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(group_id)
    }

    fn direct_spec(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
        body: &DirectBody,
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        let key = crypto::agree(sender, recipient)?;
        let plaintext =
            bincode::serialize(body).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
        let message = encode_envelope(&SealedEnvelope::Direct {
            sender: sender.public_key(),
            device: *recipient,
            ciphertext: crypto::encrypt(&key, &plaintext)?,
        })?;

        Ok(ProtocolMessageSpec {
            message,
            shared_secret: Some(SharedSecret {
                identity: *recipient,
                key,
            }),
            agreed_secret: self.has_session(recipient),
        })
    }

    fn handle_direct(
        &self,
        receiver: &Identity,
        sender: PublicKey,
        ciphertext: &[u8],
        skip_negotiation: bool,
    ) -> Result<DecryptedMessage, EncryptionError> {
        let key = crypto::agree(receiver, &sender)?;
        let plaintext = crypto::decrypt(&key, ciphertext)?;
        let body: DirectBody =
            bincode::deserialize(&plaintext).map_err(|e| EncryptionError::Malformed(e.to_string()))?;

        let mut shared_secrets = Vec::new();
        if !skip_negotiation {
            let new_session = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(sender);
            if new_session {
                debug!(peer = %sender.short(), "negotiated shared secret");
                shared_secrets.push(SharedSecret {
                    identity: sender,
                    key,
                });
            }
        }

        let mut installed_groups = Vec::new();
        let payload = match body {
            DirectBody::Payload(payload) => Some(payload),
            DirectBody::Bundle => None,
            DirectBody::GroupKey { group_id, key } => {
                self.group_keys
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(group_id.clone(), key);
                debug!(group = %hex::encode(&group_id), "installed hash ratchet key");
                installed_groups.push(group_id);
                None
            }
        };

        Ok(DecryptedMessage {
            payload,
            shared_secrets,
            installed_groups,
        })
    }
}

impl EncryptionProtocol for SealedBoxProtocol {
    fn build_direct_message(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        self.direct_spec(sender, recipient, &DirectBody::Payload(payload.to_vec()))
    }

    fn build_public_message(
        &self,
        _sender: &Identity,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        let message = encode_envelope(&SealedEnvelope::Public {
            payload: payload.to_vec(),
        })?;
        Ok(ProtocolMessageSpec::plain(message))
    }

    fn build_dh_message(
        &self,
        _sender: &Identity,
        recipient: &PublicKey,
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        let ephemeral = Identity::generate();
        let key = crypto::agree(&ephemeral, recipient)?;
        let message = encode_envelope(&SealedEnvelope::Dh {
            ephemeral: ephemeral.public_key(),
            device: *recipient,
            ciphertext: crypto::encrypt(&key, payload)?,
        })?;
        Ok(ProtocolMessageSpec::plain(message))
    }

    fn build_bundle_advertise_message(
        &self,
        sender: &Identity,
        recipient: &PublicKey,
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        self.direct_spec(sender, recipient, &DirectBody::Bundle)
    }

    fn build_hash_ratchet_message(
        &self,
        group_id: &[u8],
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, EncryptionError> {
        let key = self
            .group_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .copied()
            .ok_or_else(|| EncryptionError::GroupNotFound(group_id.to_vec()))?;

        let message = encode_envelope(&SealedEnvelope::HashRatchet {
            group_id: group_id.to_vec(),
            ciphertext: crypto::encrypt(&key, payload)?,
        })?;
        Ok(ProtocolMessageSpec::plain(message))
    }

    fn key_exchange_message_specs(
        &self,
        group_id: &[u8],
        sender: &Identity,
        recipients: &[PublicKey],
        rekey: bool,
    ) -> Result<Vec<ProtocolMessageSpec>, EncryptionError> {
        let key = {
            let mut keys = self
                .group_keys
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match keys.get(group_id).copied() {
                Some(key) if !rekey => key,
                _ => {
                    let key = crypto::generate_symmetric_key();
                    keys.insert(group_id.to_vec(), key);
                    key
                }
            }
        };

        recipients
            .iter()
            .map(|recipient| {
                self.direct_spec(
                    sender,
                    recipient,
                    &DirectBody::GroupKey {
                        group_id: group_id.to_vec(),
                        key,
                    },
                )
            })
            .collect()
    }

    fn handle_message(
        &self,
        receiver: &Identity,
        payload: &[u8],
        skip_negotiation: bool,
    ) -> Result<DecryptedMessage, EncryptionError> {
        match decode_envelope(payload)? {
            SealedEnvelope::Public { payload } => Ok(DecryptedMessage {
                payload: Some(payload),
                ..Default::default()
            }),
            SealedEnvelope::Direct {
                sender,
                device,
                ciphertext,
            } => {
                if device != receiver.public_key() {
                    return Err(EncryptionError::DeviceNotFound(sender));
                }
                self.handle_direct(receiver, sender, &ciphertext, skip_negotiation)
            }
            SealedEnvelope::Dh {
                ephemeral,
                device,
                ciphertext,
            } => {
                if device != receiver.public_key() {
                    return Err(EncryptionError::DeviceNotFound(ephemeral));
                }
                let key = crypto::agree(receiver, &ephemeral)?;
                Ok(DecryptedMessage {
                    payload: Some(crypto::decrypt(&key, &ciphertext)?),
                    ..Default::default()
                })
            }
            SealedEnvelope::HashRatchet {
                group_id,
                ciphertext,
            } => {
                let key = self
                    .group_keys
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&group_id)
                    .copied()
                    .ok_or_else(|| EncryptionError::GroupNotFound(group_id.clone()))?;
                Ok(DecryptedMessage {
                    payload: Some(crypto::decrypt(&key, &ciphertext)?),
                    ..Default::default()
                })
            }
        }
    }

    fn should_advertise_bundle(&self, peer: &PublicKey, now: i64) -> Result<bool, EncryptionError> {
        let advertised = self
            .advertised
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(advertised
            .get(peer)
            .map_or(true, |last| now - last >= BUNDLE_ADVERTISE_INTERVAL_SECS))
    }

    fn confirm_bundle_advertisement(&self, peer: &PublicKey, now: i64) {
        self.advertised
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*peer, now);
    }
}
