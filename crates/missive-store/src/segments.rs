use missive_shared::segmentation::SegmentMessage;
use missive_shared::types::PublicKey;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Persist one received segment. Redelivery of the same segment is
    /// ignored.
    pub fn save_message_segment(
        &self,
        segment: &SegmentMessage,
        sender: &PublicKey,
        timestamp: i64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_segments
                 (hash, sig_pub_key, is_parity, position, segments_count,
                  parity_segments_count, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                segment.entire_message_hash.as_slice(),
                sender.to_hex(),
                segment.is_parity(),
                segment.position(),
                segment.segments_count,
                segment.parity_segments_count,
                segment.payload,
                timestamp,
            ],
        )?;
        Ok(affected > 0)
    }

    /// All segments received for `(hash, sender)`, data segments first, each
    /// group in position order.
    pub fn message_segments(&self, hash: &[u8; 32], sender: &PublicKey) -> Result<Vec<SegmentMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT is_parity, position, segments_count, parity_segments_count, payload
             FROM message_segments
             WHERE hash = ?1 AND sig_pub_key = ?2
             ORDER BY is_parity ASC, position ASC",
        )?;

        let rows = stmt.query_map(params![hash.as_slice(), sender.to_hex()], |row| {
            let is_parity: bool = row.get(0)?;
            let position: u32 = row.get(1)?;
            Ok(SegmentMessage {
                entire_message_hash: *hash,
                index: if is_parity { 0 } else { position },
                segments_count: row.get(2)?,
                parity_segment_index: if is_parity { position } else { 0 },
                parity_segments_count: row.get(3)?,
                payload: row.get(4)?,
            })
        })?;

        let mut segments = Vec::new();
        for row in rows {
            segments.push(row?);
        }
        Ok(segments)
    }

    pub fn is_message_already_completed(&self, hash: &[u8; 32], sender: &PublicKey) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM message_segments_completed WHERE hash = ?1 AND sig_pub_key = ?2",
            params![hash.as_slice(), sender.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop the stored segments for `(hash, sender)` and record completion.
    pub fn complete_message_segments(
        &mut self,
        hash: &[u8; 32],
        sender: &PublicKey,
        timestamp: i64,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM message_segments WHERE hash = ?1 AND sig_pub_key = ?2",
            params![hash.as_slice(), sender.to_hex()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO message_segments_completed (hash, sig_pub_key, timestamp)
             VALUES (?1, ?2, ?3)",
            params![hash.as_slice(), sender.to_hex(), timestamp],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Sweep segments and completion markers recorded before `timestamp`.
    /// Returns the number of rows removed.
    pub fn remove_message_segments_older_than(&self, timestamp: i64) -> Result<usize> {
        let segments = self.conn().execute(
            "DELETE FROM message_segments WHERE timestamp < ?1",
            params![timestamp],
        )?;
        let completed = self.conn().execute(
            "DELETE FROM message_segments_completed WHERE timestamp < ?1",
            params![timestamp],
        )?;

        tracing::debug!(segments, completed, "swept expired message segments");
        Ok(segments + completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missive_shared::segmentation::split;

    fn sender() -> PublicKey {
        PublicKey([8u8; 32])
    }

    #[test]
    fn segments_come_back_data_first() {
        let db = Database::open_in_memory().unwrap();
        let payload: Vec<u8> = (0..800u32).map(|i| (i % 200) as u8).collect();
        let segments = split(&payload, 100).unwrap();
        assert_eq!(segments.len(), 9);

        for segment in segments.iter().rev() {
            assert!(db.save_message_segment(segment, &sender(), 10).unwrap());
        }

        let hash = segments[0].entire_message_hash;
        let loaded = db.message_segments(&hash, &sender()).unwrap();
        assert_eq!(loaded, segments);
    }

    #[test]
    fn duplicate_segment_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let payload = vec![1u8; 300];
        let segments = split(&payload, 256).unwrap();

        assert!(db.save_message_segment(&segments[0], &sender(), 10).unwrap());
        assert!(!db.save_message_segment(&segments[0], &sender(), 11).unwrap());

        let hash = segments[0].entire_message_hash;
        assert_eq!(db.message_segments(&hash, &sender()).unwrap().len(), 1);
    }

    #[test]
    fn completion_is_per_sender() {
        let mut db = Database::open_in_memory().unwrap();
        let hash = [4u8; 32];

        db.complete_message_segments(&hash, &sender(), 10).unwrap();
        assert!(db.is_message_already_completed(&hash, &sender()).unwrap());
        assert!(!db
            .is_message_already_completed(&hash, &PublicKey([9u8; 32]))
            .unwrap());
    }

    #[test]
    fn sweep_removes_old_rows_only() {
        let mut db = Database::open_in_memory().unwrap();
        let segments = split(&[2u8; 300], 256).unwrap();
        let hash = segments[0].entire_message_hash;

        db.save_message_segment(&segments[0], &sender(), 100).unwrap();
        db.complete_message_segments(&[5u8; 32], &sender(), 100).unwrap();
        db.save_message_segment(&segments[1], &PublicKey([6u8; 32]), 500).unwrap();

        assert_eq!(db.remove_message_segments_older_than(200).unwrap(), 2);
        assert!(db.message_segments(&hash, &sender()).unwrap().is_empty());
        assert_eq!(
            db.message_segments(&hash, &PublicKey([6u8; 32])).unwrap().len(),
            1
        );
    }
}
