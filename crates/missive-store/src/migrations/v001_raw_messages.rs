//! v001 -- Outbound raw messages and their pending delivery confirmations.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Raw messages kept for resend
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS raw_messages (
    id                        TEXT PRIMARY KEY NOT NULL,  -- 0x-prefixed hex message id
    local_chat_id             TEXT NOT NULL,
    resend_type               INTEGER NOT NULL,
    resend_method             INTEGER NOT NULL,
    skip_encryption           INTEGER NOT NULL DEFAULT 0,
    send_on_personal_topic    INTEGER NOT NULL DEFAULT 0,
    ephemeral                 INTEGER NOT NULL DEFAULT 0,
    message_type              INTEGER NOT NULL,
    payload                   BLOB NOT NULL,
    recipients                TEXT NOT NULL,              -- JSON array of hex pubkeys
    last_sent                 INTEGER NOT NULL DEFAULT 0, -- unix millis
    send_count                INTEGER NOT NULL DEFAULT 0,
    sent                      INTEGER NOT NULL DEFAULT 0,
    community_id              BLOB,
    community_key_ex_msg_type INTEGER NOT NULL DEFAULT 0,
    pubsub_topic              TEXT,
    hash_ratchet_group_id     BLOB
);

CREATE INDEX IF NOT EXISTS idx_raw_messages_resend
    ON raw_messages(resend_type, send_count);

-- ----------------------------------------------------------------
-- Per-recipient confirmations of reliably delivered batches
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS raw_message_confirmations (
    datasync_id  BLOB NOT NULL,
    message_id   TEXT NOT NULL,
    public_key   TEXT NOT NULL,               -- hex-encoded recipient pubkey
    confirmed_at INTEGER NOT NULL DEFAULT 0,  -- unix seconds, 0 while pending

    UNIQUE (datasync_id, message_id, public_key)
);

CREATE INDEX IF NOT EXISTS idx_confirmations_message_id
    ON raw_message_confirmations(message_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
