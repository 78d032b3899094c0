use missive_shared::types::PublicKey;
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::HashRatchetMessage;

impl Database {
    /// Hold a group message whose key has not arrived yet. Returns false when
    /// the same envelope is already held.
    pub fn save_hash_ratchet_message(&self, message: &HashRatchetMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO hash_ratchet_messages
                 (hash, group_id, sig_pub_key, dst, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.hash.as_slice(),
                message.group_id,
                message.sender.to_hex(),
                message.dst.as_ref().map(PublicKey::to_hex),
                message.payload,
                message.timestamp,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Held messages for `group_id`, oldest first.
    pub fn hash_ratchet_messages(&self, group_id: &[u8]) -> Result<Vec<HashRatchetMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT hash, sig_pub_key, dst, payload, timestamp
             FROM hash_ratchet_messages
             WHERE group_id = ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![group_id], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (hash, sender, dst, payload, timestamp) = row?;
            let hash: [u8; 32] = hash
                .try_into()
                .map_err(|_| StoreError::Corrupt("hash ratchet message hash".into()))?;
            let key = |s: &str| PublicKey::from_hex(s).map_err(|e| StoreError::Corrupt(e.to_string()));
            out.push(HashRatchetMessage {
                hash,
                group_id: group_id.to_vec(),
                sender: key(&sender)?,
                dst: dst.as_deref().map(key).transpose()?,
                payload,
                timestamp,
            });
        }
        Ok(out)
    }

    /// Remove and return every message held for `group_id`.
    pub fn take_hash_ratchet_messages(&mut self, group_id: &[u8]) -> Result<Vec<HashRatchetMessage>> {
        let messages = self.hash_ratchet_messages(group_id)?;
        if !messages.is_empty() {
            let tx = self.conn_mut().transaction()?;
            tx.execute(
                "DELETE FROM hash_ratchet_messages WHERE group_id = ?1",
                params![group_id],
            )?;
            tx.commit()?;
        }
        Ok(messages)
    }

    /// Sweep held messages received before `timestamp`.
    pub fn remove_hash_ratchet_messages_older_than(&self, timestamp: i64) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM hash_ratchet_messages WHERE timestamp < ?1",
            params![timestamp],
        )?;
        tracing::debug!(removed, "swept expired hash ratchet messages");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(hash: u8, group: &[u8], timestamp: i64) -> HashRatchetMessage {
        HashRatchetMessage {
            hash: [hash; 32],
            group_id: group.to_vec(),
            sender: PublicKey([3u8; 32]),
            dst: None,
            payload: vec![hash; 16],
            timestamp,
        }
    }

    #[test]
    fn take_returns_group_messages_once() {
        let mut db = Database::open_in_memory().unwrap();
        let mut second = held(2, b"group-a", 20);
        second.dst = Some(PublicKey([4u8; 32]));

        assert!(db.save_hash_ratchet_message(&second).unwrap());
        assert!(db.save_hash_ratchet_message(&held(1, b"group-a", 10)).unwrap());
        assert!(db.save_hash_ratchet_message(&held(3, b"group-b", 5)).unwrap());
        assert!(!db.save_hash_ratchet_message(&held(1, b"group-a", 11)).unwrap());

        let taken = db.take_hash_ratchet_messages(b"group-a").unwrap();
        assert_eq!(taken, vec![held(1, b"group-a", 10), second]);
        assert!(db.take_hash_ratchet_messages(b"group-a").unwrap().is_empty());
        assert_eq!(db.hash_ratchet_messages(b"group-b").unwrap().len(), 1);
    }

    #[test]
    fn sweep_removes_old_messages_only() {
        let db = Database::open_in_memory().unwrap();
        db.save_hash_ratchet_message(&held(1, b"group", 100)).unwrap();
        db.save_hash_ratchet_message(&held(2, b"group", 500)).unwrap();

        assert_eq!(db.remove_hash_ratchet_messages_older_than(200).unwrap(), 1);
        let left = db.hash_ratchet_messages(b"group").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].hash, [2u8; 32]);
    }
}
