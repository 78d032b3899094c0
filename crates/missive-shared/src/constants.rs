/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/missive/1.0.0";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Default maximum transport payload size in bytes (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Envelope time-to-live in seconds
pub const ENVELOPE_TTL: u32 = 15;

/// Proof-of-work target for ordinary payloads
pub const DEFAULT_POW_TARGET: f64 = 0.002;

/// Proof-of-work target once a payload exceeds `LARGE_PAYLOAD_BYTES`
pub const LARGE_PAYLOAD_POW_TARGET: f64 = 0.000002;

/// Payload size above which the reduced PoW target applies (roughly 50 KB)
pub const LARGE_PAYLOAD_BYTES: usize = 50_000;

/// Proof-of-work time budget in seconds
pub const POW_TIME: u32 = 5;

/// Ratio of parity segments to data segments
pub const SEGMENTS_PARITY_RATE: f64 = 0.125;

/// Upper bound on data + parity shards for Reed-Solomon over GF(2^8)
pub const SEGMENTS_REED_SOLOMON_MAX_COUNT: usize = 256;

/// Persisted segments older than this are swept
pub const SEGMENT_EXPIRY_DAYS: i64 = 30;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Number of partitions for the partitioned contact topics
pub const PARTITIONS_COUNT: u64 = 5000;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SHARED_SECRET: &str = "missive-shared-secret-v1";
pub const KDF_CONTEXT_TOPIC: &str = "missive-topic-v1";
pub const KDF_CONTEXT_LIBP2P: &str = "missive-libp2p-keypair-v1";

/// Pow target for a payload of the given size.
pub fn calculate_pow(payload: &[u8]) -> f64 {
    if payload.len() > LARGE_PAYLOAD_BYTES {
        LARGE_PAYLOAD_POW_TARGET
    } else {
        DEFAULT_POW_TARGET
    }
}
