//! Pub/sub transport binding: signed envelopes, topic derivation, envelope
//! tracking, and a libp2p GossipSub swarm over QUIC.

pub mod behaviour;
pub mod builder;
pub mod discovery;
pub mod envelope;
pub mod gossip;
pub mod memory;
pub mod monitor;
pub mod swarm;
pub mod topics;
pub mod transport;

pub use behaviour::{MissiveBehaviour, MissiveEvent};
pub use builder::{build_swarm, libp2p_keypair};
pub use discovery::parse_peer_list;
pub use envelope::{EnvelopeHash, NewMessage, TransportMessage, WireEnvelope};
pub use gossip::GossipTransport;
pub use memory::{MemoryTransport, RecordedSend, SendKind};
pub use monitor::EnvelopeMonitor;
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::{SharedSecret, Transport, TransportError};
