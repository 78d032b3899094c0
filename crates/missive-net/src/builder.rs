use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::{identify, SwarmBuilder};
use tracing::info;

use missive_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, KDF_CONTEXT_LIBP2P, PROTOCOL_VERSION};
use missive_shared::identity::Identity;

use crate::behaviour::MissiveBehaviour;

/// Room left on top of the payload limit for the envelope itself.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

pub fn build_swarm(
    keypair: Keypair,
    max_message_size: usize,
) -> anyhow::Result<libp2p::Swarm<MissiveBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<MissiveBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            // Envelopes are already content-addressed; deduplicate on the bytes.
            let message_id_fn = |message: &gossipsub::Message| {
                MessageId::from(blake3::hash(&message.data).to_hex().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(max_message_size + ENVELOPE_OVERHEAD)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    format!("GossipSub config: {e}").into()
                })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                format!("GossipSub init: {e}").into()
            })?;

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            Ok(MissiveBehaviour { gossipsub, identify })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        "Built Missive swarm with QUIC transport"
    );

    Ok(swarm)
}

/// Deterministic libp2p keypair for a node identity.
pub fn libp2p_keypair(identity: &Identity) -> anyhow::Result<Keypair> {
    let mut seed = identity.derive_seed(KDF_CONTEXT_LIBP2P);
    Keypair::ed25519_from_bytes(&mut seed)
        .map_err(|e| anyhow::anyhow!("Failed to create libp2p keypair: {e}"))
}
