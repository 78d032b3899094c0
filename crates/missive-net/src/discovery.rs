//! Bootstrap peer parsing.
//!
//! Peers are configured as a comma- or newline-separated list of multiaddrs,
//! typically from the `BOOTSTRAP_PEERS` environment variable.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use tracing::{debug, warn};

/// Parse a list of multiaddrs. Empty entries and entries starting with `#`
/// are ignored; malformed ones are logged and skipped.
pub fn parse_peer_list(raw: &str) -> Vec<Multiaddr> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with('#'))
        .filter_map(|entry| match entry.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// Extract a `PeerId` from a multiaddr, if one is present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
