//! Composed libp2p `NetworkBehaviour` for Missive nodes.
//!
//! Combines GossipSub (topic-addressed envelopes) and Identify (protocol
//! negotiation).

use libp2p::{gossipsub, identify, swarm::NetworkBehaviour};

/// Composed network behaviour, driven by the single swarm event loop.
/// Construction is handled by [`super::builder::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MissiveEvent")]
pub struct MissiveBehaviour {
    /// Pub/sub delivery of wire envelopes
    pub gossipsub: gossipsub::Behaviour,
    /// Protocol identification and capability advertisement
    pub identify: identify::Behaviour,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum MissiveEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
}

impl From<gossipsub::Event> for MissiveEvent {
    fn from(event: gossipsub::Event) -> Self {
        MissiveEvent::Gossipsub(event)
    }
}

impl From<identify::Event> for MissiveEvent {
    fn from(event: identify::Event) -> Self {
        MissiveEvent::Identify(event)
    }
}
