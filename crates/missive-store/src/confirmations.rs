use missive_shared::types::{MessageId, PublicKey};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Confirmation;

impl Database {
    /// Record that `public_key` has yet to acknowledge `message_id`, carried
    /// in batch `datasync_id`. Re-inserting the same tuple is a no-op.
    pub fn insert_pending_confirmation(
        &self,
        datasync_id: &[u8],
        message_id: &MessageId,
        public_key: &PublicKey,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO raw_message_confirmations
                 (datasync_id, message_id, public_key, confirmed_at)
             VALUES (?1, ?2, ?3, 0)",
            params![datasync_id, message_id.to_hex(), public_key.to_hex()],
        )?;
        Ok(())
    }

    /// Mark every tuple for `datasync_id` as confirmed now.
    ///
    /// Returns the message ID once it counts as delivered: all of its tuples
    /// are confirmed, or any one of them when `at_least_one` is set. The
    /// message's tuples are then dropped.
    pub fn mark_as_confirmed(
        &mut self,
        datasync_id: &[u8],
        at_least_one: bool,
    ) -> Result<Option<MessageId>> {
        let confirmed_at = chrono::Utc::now().timestamp();
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "UPDATE raw_message_confirmations SET confirmed_at = ?1
             WHERE datasync_id = ?2 AND confirmed_at = 0",
            params![confirmed_at, datasync_id],
        )?;

        let message_id: Option<String> = tx
            .query_row(
                "SELECT message_id FROM raw_message_confirmations WHERE datasync_id = ?1",
                params![datasync_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(message_id) = message_id else {
            tx.commit()?;
            return Ok(None);
        };

        let unconfirmed: i64 = tx.query_row(
            "SELECT COUNT(*) FROM raw_message_confirmations
             WHERE message_id = ?1 AND confirmed_at = 0",
            params![message_id],
            |row| row.get(0),
        )?;

        let delivered = unconfirmed == 0 || at_least_one;
        if delivered {
            tx.execute(
                "DELETE FROM raw_message_confirmations WHERE message_id = ?1",
                params![message_id],
            )?;
        }
        tx.commit()?;

        if !delivered {
            return Ok(None);
        }
        MessageId::from_hex(&message_id)
            .map(Some)
            .map_err(StoreError::Hex)
    }

    pub fn confirmations_for_message(&self, message_id: &MessageId) -> Result<Vec<Confirmation>> {
        let mut stmt = self.conn().prepare(
            "SELECT datasync_id, message_id, public_key, confirmed_at
             FROM raw_message_confirmations
             WHERE message_id = ?1
             ORDER BY public_key",
        )?;

        let rows = stmt.query_map(params![message_id.to_hex()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (datasync_id, message_id, public_key, confirmed_at) = row?;
            out.push(Confirmation {
                datasync_id,
                message_id: MessageId::from_hex(&message_id)?,
                public_key: PublicKey::from_hex(&public_key)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                confirmed_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (PublicKey, PublicKey) {
        (PublicKey([1u8; 32]), PublicKey([2u8; 32]))
    }

    #[test]
    fn confirmed_once_every_recipient_acks() {
        let mut db = Database::open_in_memory().unwrap();
        let message_id = MessageId([9u8; 32]);
        let (alice, bob) = keys();

        db.insert_pending_confirmation(b"batch-a", &message_id, &alice).unwrap();
        db.insert_pending_confirmation(b"batch-b", &message_id, &bob).unwrap();

        assert_eq!(db.mark_as_confirmed(b"batch-a", false).unwrap(), None);
        let pending = db.confirmations_for_message(&message_id).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.iter().filter(|c| c.is_confirmed()).count(), 1);

        assert_eq!(
            db.mark_as_confirmed(b"batch-b", false).unwrap(),
            Some(message_id)
        );
        assert!(db.confirmations_for_message(&message_id).unwrap().is_empty());
    }

    #[test]
    fn at_least_one_confirms_immediately() {
        let mut db = Database::open_in_memory().unwrap();
        let message_id = MessageId([7u8; 32]);
        let (alice, bob) = keys();

        db.insert_pending_confirmation(b"batch-a", &message_id, &alice).unwrap();
        db.insert_pending_confirmation(b"batch-b", &message_id, &bob).unwrap();

        assert_eq!(
            db.mark_as_confirmed(b"batch-a", true).unwrap(),
            Some(message_id)
        );
    }

    #[test]
    fn unknown_batch_is_none() {
        let mut db = Database::open_in_memory().unwrap();
        assert_eq!(db.mark_as_confirmed(b"nothing", false).unwrap(), None);
    }

    #[test]
    fn duplicate_pending_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let message_id = MessageId([5u8; 32]);
        let (alice, _) = keys();

        db.insert_pending_confirmation(b"batch", &message_id, &alice).unwrap();
        db.insert_pending_confirmation(b"batch", &message_id, &alice).unwrap();
        assert_eq!(db.confirmations_for_message(&message_id).unwrap().len(), 1);
    }
}
