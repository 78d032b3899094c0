//! Splitting oversized wire payloads into chunks and putting them back
//! together.
//!
//! Chunks are serialized behind a 4-byte magic so the receive path can tell a
//! chunk apart from an unsegmented payload. When enough chunks are produced,
//! systematic Reed-Solomon parity chunks are appended so that any
//! `segments_count` of the `segments_count + parity_segments_count` chunks
//! are sufficient to recover the payload.

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

use crate::constants::{SEGMENTS_PARITY_RATE, SEGMENTS_REED_SOLOMON_MAX_COUNT};
use crate::error::SegmentationError;
use crate::types::content_hash;

pub const SEGMENT_MAGIC: &[u8; 4] = b"MSEG";

/// One wire-level chunk of a segmented payload.
///
/// Data chunks carry `index`/`segments_count`; parity chunks carry
/// `segments_count == 0` and `parity_segment_index`/`parity_segments_count`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMessage {
    pub entire_message_hash: [u8; 32],
    pub index: u32,
    pub segments_count: u32,
    pub parity_segment_index: u32,
    pub parity_segments_count: u32,
    pub payload: Vec<u8>,
}

impl SegmentMessage {
    pub fn is_parity(&self) -> bool {
        self.segments_count == 0 && self.parity_segments_count > 0
    }

    /// Valid under the first, parity-unaware segmentation scheme.
    pub fn is_valid_v1(&self) -> bool {
        self.segments_count >= 2
    }

    pub fn is_valid_v2(&self) -> bool {
        self.segments_count >= 2 || self.parity_segments_count > 0
    }

    /// Position among chunks of the same kind.
    pub fn position(&self) -> u32 {
        if self.is_parity() {
            self.parity_segment_index
        } else {
            self.index
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SegmentationError> {
        let body =
            bincode::serialize(self).map_err(|e| SegmentationError::Malformed(e.to_string()))?;
        let mut out = Vec::with_capacity(SEGMENT_MAGIC.len() + body.len());
        out.extend_from_slice(SEGMENT_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Whether `data` looks like a serialized chunk.
    pub fn is_segment(data: &[u8]) -> bool {
        data.starts_with(SEGMENT_MAGIC)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SegmentationError> {
        let body = data
            .strip_prefix(SEGMENT_MAGIC.as_slice())
            .ok_or_else(|| SegmentationError::Malformed("missing segment magic".into()))?;
        bincode::deserialize(body).map_err(|e| SegmentationError::Malformed(e.to_string()))
    }
}

/// Cut `payload` into chunks of at most `limit` bytes, appending parity
/// chunks when the shard count allows it. Returns an empty vector when the
/// payload already fits.
pub fn split(payload: &[u8], limit: usize) -> Result<Vec<SegmentMessage>, SegmentationError> {
    if limit == 0 {
        return Err(SegmentationError::InvalidCount);
    }
    if payload.len() <= limit {
        return Ok(Vec::new());
    }

    let hash = content_hash(payload);
    let segments_count = payload.len().div_ceil(limit);
    let parity_segments_count = (segments_count as f64 * SEGMENTS_PARITY_RATE).floor() as usize;
    let with_parity = parity_segments_count > 0
        && segments_count + parity_segments_count <= SEGMENTS_REED_SOLOMON_MAX_COUNT;

    let mut segments = Vec::with_capacity(segments_count + parity_segments_count);
    let mut shards: Vec<Vec<u8>> = Vec::new();

    for (index, chunk) in payload.chunks(limit).enumerate() {
        segments.push(SegmentMessage {
            entire_message_hash: hash,
            index: index as u32,
            segments_count: segments_count as u32,
            parity_segment_index: 0,
            parity_segments_count: 0,
            payload: chunk.to_vec(),
        });

        if with_parity {
            let mut shard = chunk.to_vec();
            shard.resize(limit, 0);
            shards.push(shard);
        }
    }

    if !with_parity {
        return Ok(segments);
    }

    shards.extend(std::iter::repeat(vec![0u8; limit]).take(parity_segments_count));
    let rs = ReedSolomon::new(segments_count, parity_segments_count)?;
    rs.encode(&mut shards)?;

    for (i, parity) in shards.into_iter().skip(segments_count).enumerate() {
        segments.push(SegmentMessage {
            entire_message_hash: hash,
            index: 0,
            segments_count: 0,
            parity_segment_index: i as u32,
            parity_segments_count: parity_segments_count as u32,
            payload: parity,
        });
    }

    Ok(segments)
}

/// Wire payloads for `payload`: the payload itself when it fits within
/// `limit`, otherwise one serialized chunk per data or parity segment.
pub fn segment_payload(payload: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, SegmentationError> {
    let segments = split(payload, limit)?;
    if segments.is_empty() {
        return Ok(vec![payload.to_vec()]);
    }
    segments.iter().map(SegmentMessage::to_bytes).collect()
}

fn sorted(segments: &[SegmentMessage]) -> Vec<&SegmentMessage> {
    let mut out: Vec<&SegmentMessage> = segments.iter().collect();
    out.sort_by_key(|s| (s.is_parity(), s.position()));
    out
}

fn check_hash(payload: &[u8], expected: &[u8; 32]) -> Result<(), SegmentationError> {
    if content_hash(payload) == *expected {
        Ok(())
    } else {
        Err(SegmentationError::HashMismatch)
    }
}

/// Reassemble a data-only chunk set. Every chunk for the message must be
/// present; parity chunks are never valid here.
pub fn reassemble_v1(segments: &[SegmentMessage]) -> Result<Vec<u8>, SegmentationError> {
    let ordered = sorted(segments);
    let first = ordered.first().ok_or(SegmentationError::Incomplete)?;
    if !first.is_valid_v1() {
        return Err(SegmentationError::InvalidCount);
    }
    if ordered.len() != first.segments_count as usize {
        return Err(SegmentationError::Incomplete);
    }

    let mut entire = Vec::new();
    for (i, segment) in ordered.iter().enumerate() {
        if segment.is_parity() || segment.index as usize != i {
            return Err(SegmentationError::Incomplete);
        }
        entire.extend_from_slice(&segment.payload);
    }

    check_hash(&entire, &first.entire_message_hash)?;
    Ok(entire)
}

/// Reassemble from any mix of data and parity chunks.
///
/// Succeeds once the number of chunks equals the data segment count, as long
/// as at least one data chunk is present to announce that count.
pub fn reassemble_v2(segments: &[SegmentMessage]) -> Result<Vec<u8>, SegmentationError> {
    let ordered = sorted(segments);
    let (first, last) = match (ordered.first(), ordered.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(SegmentationError::Incomplete),
    };

    if first.is_parity() || ordered.len() != first.segments_count as usize {
        return Err(SegmentationError::Incomplete);
    }

    let data_count = first.segments_count as usize;
    let expected = &first.entire_message_hash;

    if !last.is_parity() {
        let mut entire = Vec::new();
        for (i, segment) in ordered.iter().enumerate() {
            if segment.index as usize != i {
                return Err(SegmentationError::Malformed(format!(
                    "unexpected data segment index {}",
                    segment.index
                )));
            }
            entire.extend_from_slice(&segment.payload);
        }
        check_hash(&entire, expected)?;
        return Ok(entire);
    }

    let parity_count = last.parity_segments_count as usize;
    let shard_len = last.payload.len();
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; data_count + parity_count];

    for segment in &ordered {
        let slot = if segment.is_parity() {
            let p = segment.parity_segment_index as usize;
            if p >= parity_count || segment.parity_segments_count as usize != parity_count {
                return Err(SegmentationError::Malformed("parity segment out of range".into()));
            }
            data_count + p
        } else {
            let i = segment.index as usize;
            if i >= data_count || segment.segments_count as usize != data_count {
                return Err(SegmentationError::Malformed("data segment out of range".into()));
            }
            i
        };
        shards[slot] = Some(segment.payload.clone());
    }

    // The final data shard travels unpadded; align it for decoding.
    let original_last = shards[data_count - 1].clone();
    if let Some(shard) = shards[data_count - 1].as_mut() {
        if shard.len() < shard_len {
            shard.resize(shard_len, 0);
        }
    }

    let rs = ReedSolomon::new(data_count, parity_count)?;
    rs.reconstruct(&mut shards)?;

    let mut full: Vec<Vec<u8>> = Vec::with_capacity(shards.len());
    for shard in shards {
        full.push(shard.ok_or(SegmentationError::InvalidParity)?);
    }
    if !rs.verify(&full)? {
        return Err(SegmentationError::InvalidParity);
    }

    let mut entire: Vec<u8> = full[..data_count - 1].concat();
    match original_last {
        Some(last_data) => {
            entire.extend_from_slice(&last_data);
            check_hash(&entire, expected)?;
            Ok(entire)
        }
        None => {
            let prefix_len = entire.len();
            entire.extend_from_slice(&full[data_count - 1]);
            trim_padding(entire, prefix_len, expected)
        }
    }
}

/// The recovered final shard still carries its zero padding. Find the length
/// whose hash matches, starting from the shortest candidate.
fn trim_padding(
    mut entire: Vec<u8>,
    prefix_len: usize,
    expected: &[u8; 32],
) -> Result<Vec<u8>, SegmentationError> {
    let padded_len = entire.len();
    let mut candidate = padded_len;
    while candidate > prefix_len && entire[candidate - 1] == 0 {
        candidate -= 1;
    }

    for len in candidate..=padded_len {
        if content_hash(&entire[..len]) == *expected {
            entire.truncate(len);
            return Ok(entire);
        }
    }
    Err(SegmentationError::HashMismatch)
}
