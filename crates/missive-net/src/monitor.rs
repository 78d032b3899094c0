//! Bookkeeping of which message IDs went out in which envelope.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use missive_shared::types::MessageId;
use tracing::debug;

use crate::envelope::EnvelopeHash;

#[derive(Debug, Clone)]
struct TrackedEnvelope {
    message_ids: Vec<MessageId>,
    expires_at: Instant,
}

/// Envelope hash to message IDs, kept until the envelope's TTL lapses.
#[derive(Debug, Default)]
pub struct EnvelopeMonitor {
    envelopes: Mutex<HashMap<EnvelopeHash, TrackedEnvelope>>,
}

impl EnvelopeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, message_ids: &[MessageId], hash: &EnvelopeHash, ttl_secs: u32) {
        let Ok(mut envelopes) = self.envelopes.lock() else {
            return;
        };
        let entry = envelopes.entry(*hash).or_insert_with(|| TrackedEnvelope {
            message_ids: Vec::new(),
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl_secs)),
        });
        for id in message_ids {
            if !entry.message_ids.contains(id) {
                entry.message_ids.push(*id);
            }
        }
        debug!(
            hash = %hex::encode(&hash[..8]),
            ids = entry.message_ids.len(),
            "tracking envelope"
        );
    }

    pub fn message_ids(&self, hash: &EnvelopeHash) -> Vec<MessageId> {
        self.envelopes
            .lock()
            .ok()
            .and_then(|envelopes| envelopes.get(hash).map(|e| e.message_ids.clone()))
            .unwrap_or_default()
    }

    /// Remove and return envelopes whose TTL has lapsed as of `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<(EnvelopeHash, Vec<MessageId>)> {
        let Ok(mut envelopes) = self.envelopes.lock() else {
            return Vec::new();
        };
        let expired: Vec<EnvelopeHash> = envelopes
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(hash, _)| *hash)
            .collect();

        expired
            .into_iter()
            .filter_map(|hash| envelopes.remove(&hash).map(|e| (hash, e.message_ids)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_is_idempotent() {
        let monitor = EnvelopeMonitor::new();
        let hash = [1u8; 32];
        let a = MessageId([2u8; 32]);
        let b = MessageId([3u8; 32]);

        monitor.track(&[a], &hash, 15);
        monitor.track(&[a, b], &hash, 15);

        assert_eq!(monitor.message_ids(&hash), vec![a, b]);
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn expired_envelopes_are_taken_once() {
        let monitor = EnvelopeMonitor::new();
        monitor.track(&[MessageId([2u8; 32])], &[1u8; 32], 0);
        monitor.track(&[MessageId([3u8; 32])], &[4u8; 32], 3600);

        let later = Instant::now() + Duration::from_secs(1);
        let expired = monitor.take_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, [1u8; 32]);
        assert!(monitor.take_expired(later).is_empty());
        assert_eq!(monitor.len(), 1);
    }
}
