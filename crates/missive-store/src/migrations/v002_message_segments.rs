//! v002 -- Received segments and the completion markers that make
//! reassembly idempotent.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS message_segments (
    hash                  BLOB NOT NULL,     -- hash of the entire payload
    sig_pub_key           TEXT NOT NULL,     -- hex-encoded sender pubkey
    is_parity             INTEGER NOT NULL,
    position              INTEGER NOT NULL,  -- index among data or parity segments
    segments_count        INTEGER NOT NULL,
    parity_segments_count INTEGER NOT NULL,
    payload               BLOB NOT NULL,
    timestamp             INTEGER NOT NULL,  -- unix seconds

    PRIMARY KEY (hash, sig_pub_key, is_parity, position)
);

CREATE INDEX IF NOT EXISTS idx_message_segments_timestamp
    ON message_segments(timestamp);

CREATE TABLE IF NOT EXISTS message_segments_completed (
    hash        BLOB NOT NULL,
    sig_pub_key TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,

    PRIMARY KEY (hash, sig_pub_key)
);

CREATE INDEX IF NOT EXISTS idx_message_segments_completed_timestamp
    ON message_segments_completed(timestamp);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
