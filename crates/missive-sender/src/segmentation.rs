//! Persistent reassembly of received chunks.
//!
//! Chunks are stored per `(entire_message_hash, sender)` until enough have
//! arrived. A completed message is remembered so late or duplicated chunks
//! are not reassembled twice.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use missive_shared::constants::SEGMENT_EXPIRY_DAYS;
use missive_shared::error::SegmentationError;
use missive_shared::segmentation::{reassemble_v1, reassemble_v2, SegmentMessage};
use missive_shared::types::PublicKey;
use missive_store::Database;

use crate::error::SenderError;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

pub struct SegmentationLayer {
    db: Arc<Mutex<Database>>,
}

impl SegmentationLayer {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Parity-unaware reassembly: every data chunk must arrive.
    pub fn handle_v1(
        &self,
        segment: &SegmentMessage,
        sender: &PublicKey,
        now: i64,
    ) -> Result<Vec<u8>, SenderError> {
        self.handle(segment, sender, now, SegmentMessage::is_valid_v1, reassemble_v1)
    }

    /// Reassembly from any `segments_count` chunks, parity included.
    pub fn handle_v2(
        &self,
        segment: &SegmentMessage,
        sender: &PublicKey,
        now: i64,
    ) -> Result<Vec<u8>, SenderError> {
        self.handle(segment, sender, now, SegmentMessage::is_valid_v2, reassemble_v2)
    }

    fn handle(
        &self,
        segment: &SegmentMessage,
        sender: &PublicKey,
        now: i64,
        is_valid: fn(&SegmentMessage) -> bool,
        reassemble: fn(&[SegmentMessage]) -> Result<Vec<u8>, SegmentationError>,
    ) -> Result<Vec<u8>, SenderError> {
        let hash = segment.entire_message_hash;
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);

        if db.is_message_already_completed(&hash, sender)? {
            return Err(SegmentationError::AlreadyCompleted.into());
        }
        if !is_valid(segment) {
            return Err(SegmentationError::InvalidCount.into());
        }

        db.save_message_segment(segment, sender, now)?;
        let segments = db.message_segments(&hash, sender)?;

        debug!(
            hash = %hex::encode(&hash[..8]),
            sender = %sender.short(),
            received = segments.len(),
            parity = segment.is_parity(),
            "stored message segment"
        );

        let entire = reassemble(&segments)?;
        db.complete_message_segments(&hash, sender, now)?;

        debug!(
            hash = %hex::encode(&hash[..8]),
            len = entire.len(),
            "reassembled segmented message"
        );
        Ok(entire)
    }

    /// Drop chunk and completion records older than the expiry window.
    pub fn cleanup(&self, now: i64) -> Result<usize, SenderError> {
        let removed = self
            .db
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_message_segments_older_than(expiry_cutoff(now))?;
        Ok(removed)
    }
}

/// Oldest timestamp still kept by the receive-side sweeps.
pub(crate) fn expiry_cutoff(now: i64) -> i64 {
    now - SEGMENT_EXPIRY_DAYS * SECONDS_PER_DAY
}
