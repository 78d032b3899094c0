//! Content-topic derivation for every addressing strategy.
//!
//! Topics are plain strings used directly as GossipSub topic names.

use missive_shared::constants::{KDF_CONTEXT_TOPIC, PARTITIONS_COUNT};
use missive_shared::types::PublicKey;

const PREFIX: &str = "/missive/1";

fn short_digest(material: &[u8]) -> String {
    let key = blake3::derive_key(KDF_CONTEXT_TOPIC, material);
    hex::encode(&key[..8])
}

/// Public chat named `chat_name`.
pub fn public_topic(chat_name: &str) -> String {
    format!("{PREFIX}/public/{}", short_digest(chat_name.as_bytes()))
}

/// One of `PARTITIONS_COUNT` buckets shared by many recipients; used until a
/// shared secret has been agreed.
pub fn partitioned_topic(recipient: &PublicKey) -> String {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&recipient.as_bytes()[..8]);
    let partition = u64::from_be_bytes(prefix) % PARTITIONS_COUNT;
    format!("{PREFIX}/contact-discovery-{partition}")
}

/// Topic only `recipient` listens on.
pub fn personal_topic(recipient: &PublicKey) -> String {
    format!("{PREFIX}/personal/{}", recipient.to_hex())
}

/// Private topic derived from an agreed pairwise key.
pub fn shared_secret_topic(secret: &[u8; 32]) -> String {
    format!("{PREFIX}/secret/{}", short_digest(secret))
}

/// Topic of a community, addressed by its public key.
pub fn community_topic(community: &PublicKey) -> String {
    format!("{PREFIX}/community/{}", community.to_hex())
}
