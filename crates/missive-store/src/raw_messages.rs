use missive_shared::protocol::MessageType;
use missive_shared::raw_message::{CommunityKeyExMsgType, RawMessage, ResendMethod, ResendType};
use missive_shared::types::PublicKey;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

const COLUMNS: &str = "id, local_chat_id, resend_type, resend_method, skip_encryption,
     send_on_personal_topic, ephemeral, message_type, payload, recipients, last_sent,
     send_count, sent, community_id, community_key_ex_msg_type, pubsub_topic,
     hash_ratchet_group_id";

impl Database {
    /// Insert or replace a raw message. The sender override and the
    /// before-dispatch hook are not persisted.
    pub fn save_raw_message(&self, message: &RawMessage) -> Result<()> {
        let recipients: Vec<String> = message.recipients.iter().map(PublicKey::to_hex).collect();

        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO raw_messages ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                message.id,
                message.local_chat_id,
                message.resend_type.as_i64(),
                message.resend_method.as_i64(),
                message.skip_encryption_layer,
                message.send_on_personal_topic,
                message.ephemeral,
                message.message_type.as_u32(),
                message.payload,
                serde_json::to_string(&recipients)?,
                message.last_sent,
                message.send_count,
                message.sent,
                message.community_id,
                message.community_key_ex_msg_type.as_i64(),
                message.pubsub_topic,
                message.hash_ratchet_group_id,
            ],
        )?;
        Ok(())
    }

    pub fn raw_message_by_id(&self, id: &str) -> Result<RawMessage> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM raw_messages WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        row.into_raw_message()
    }

    /// Messages persisted for raw-message retry that have been sent fewer
    /// than `max_send_count` times, oldest dispatch first.
    pub fn raw_messages_for_resend(&self, max_send_count: u32) -> Result<Vec<RawMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM raw_messages
             WHERE resend_type = ?1 AND send_count < ?2
             ORDER BY last_sent ASC"
        ))?;

        let rows = stmt.query_map(
            params![ResendType::RawMessageRetry.as_i64(), max_send_count],
            read_row,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_raw_message()?);
        }
        Ok(messages)
    }

    pub fn update_raw_message_sent(
        &self,
        id: &str,
        sent: bool,
        send_count: u32,
        last_sent: i64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE raw_messages SET sent = ?2, send_count = ?3, last_sent = ?4 WHERE id = ?1",
            params![id, sent, send_count, last_sent],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_raw_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM raw_messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

/// Column values as read, before conversion into domain enums.
struct RawMessageRow {
    id: String,
    local_chat_id: String,
    resend_type: i64,
    resend_method: i64,
    skip_encryption: bool,
    send_on_personal_topic: bool,
    ephemeral: bool,
    message_type: u32,
    payload: Vec<u8>,
    recipients: String,
    last_sent: i64,
    send_count: u32,
    sent: bool,
    community_id: Option<Vec<u8>>,
    community_key_ex_msg_type: i64,
    pubsub_topic: Option<String>,
    hash_ratchet_group_id: Option<Vec<u8>>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessageRow> {
    Ok(RawMessageRow {
        id: row.get(0)?,
        local_chat_id: row.get(1)?,
        resend_type: row.get(2)?,
        resend_method: row.get(3)?,
        skip_encryption: row.get(4)?,
        send_on_personal_topic: row.get(5)?,
        ephemeral: row.get(6)?,
        message_type: row.get(7)?,
        payload: row.get(8)?,
        recipients: row.get(9)?,
        last_sent: row.get(10)?,
        send_count: row.get(11)?,
        sent: row.get(12)?,
        community_id: row.get(13)?,
        community_key_ex_msg_type: row.get(14)?,
        pubsub_topic: row.get(15)?,
        hash_ratchet_group_id: row.get(16)?,
    })
}

impl RawMessageRow {
    fn into_raw_message(self) -> Result<RawMessage> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("raw message {}: {what}", self.id));

        let resend_type =
            ResendType::from_i64(self.resend_type).ok_or_else(|| corrupt("resend_type"))?;
        let resend_method =
            ResendMethod::from_i64(self.resend_method).ok_or_else(|| corrupt("resend_method"))?;
        let community_key_ex_msg_type =
            CommunityKeyExMsgType::from_i64(self.community_key_ex_msg_type)
                .ok_or_else(|| corrupt("community_key_ex_msg_type"))?;
        let message_type =
            MessageType::try_from(self.message_type).map_err(|_| corrupt("message_type"))?;

        let hex_keys: Vec<String> = serde_json::from_str(&self.recipients)?;
        let recipients = hex_keys
            .iter()
            .map(|k| PublicKey::from_hex(k).map_err(|_| corrupt("recipients")))
            .collect::<Result<Vec<_>>>()?;

        Ok(RawMessage {
            id: self.id,
            local_chat_id: self.local_chat_id,
            resend_type,
            resend_method,
            skip_encryption_layer: self.skip_encryption,
            send_on_personal_topic: self.send_on_personal_topic,
            ephemeral: self.ephemeral,
            message_type,
            payload: self.payload,
            sender: None,
            recipients,
            last_sent: self.last_sent,
            send_count: self.send_count,
            sent: self.sent,
            community_id: self.community_id,
            community_key_ex_msg_type,
            pubsub_topic: self.pubsub_topic,
            hash_ratchet_group_id: self.hash_ratchet_group_id,
            before_dispatch: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> RawMessage {
        let mut raw = RawMessage::new("chat-1", MessageType::ChatMessage, b"payload".to_vec());
        raw.id = id.to_string();
        raw.resend_type = ResendType::RawMessageRetry;
        raw.resend_method = ResendMethod::SendPrivate;
        raw.recipients = vec![PublicKey([3u8; 32]), PublicKey([4u8; 32])];
        raw.pubsub_topic = Some("/waku/test".into());
        raw
    }

    #[test]
    fn save_and_load() {
        let db = Database::open_in_memory().unwrap();
        db.save_raw_message(&sample("0x01")).unwrap();

        let loaded = db.raw_message_by_id("0x01").unwrap();
        assert_eq!(loaded.local_chat_id, "chat-1");
        assert_eq!(loaded.resend_method, ResendMethod::SendPrivate);
        assert_eq!(loaded.recipients, sample("0x01").recipients);
        assert_eq!(loaded.pubsub_topic.as_deref(), Some("/waku/test"));
        assert!(loaded.sender.is_none());
    }

    #[test]
    fn missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.raw_message_by_id("0xdead"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn resend_candidates_respect_limit_and_type() {
        let db = Database::open_in_memory().unwrap();
        db.save_raw_message(&sample("0x01")).unwrap();
        db.save_raw_message(&sample("0x02")).unwrap();

        let mut plain = sample("0x03");
        plain.resend_type = ResendType::None;
        db.save_raw_message(&plain).unwrap();

        assert!(db.update_raw_message_sent("0x02", true, 3, 1_000).unwrap());

        let due = db.raw_messages_for_resend(3).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "0x01");

        assert!(db.delete_raw_message("0x01").unwrap());
        assert!(db.raw_messages_for_resend(3).unwrap().is_empty());
    }
}
