//! v003 -- Encrypted group messages received before their group key.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hash_ratchet_messages (
    hash        BLOB PRIMARY KEY NOT NULL,  -- transport envelope hash
    group_id    BLOB NOT NULL,
    sig_pub_key TEXT NOT NULL,              -- hex-encoded envelope signer
    dst         TEXT,                       -- hex-encoded envelope recipient
    payload     BLOB NOT NULL,              -- reassembled encryption-layer payload
    timestamp   INTEGER NOT NULL            -- unix seconds
);

CREATE INDEX IF NOT EXISTS idx_hash_ratchet_messages_group
    ON hash_ratchet_messages(group_id);

CREATE INDEX IF NOT EXISTS idx_hash_ratchet_messages_timestamp
    ON hash_ratchet_messages(timestamp);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
