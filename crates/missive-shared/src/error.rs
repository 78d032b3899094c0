use thiserror::Error;

#[derive(Error, Debug)]
pub enum MissiveError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Segmentation error: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Dispatch aborted: {0}")]
    DispatchAborted(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

/// Errors raised while wrapping or unwrapping the application metadata layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed application metadata: {0}")]
    Malformed(String),

    #[error("Application metadata signature does not verify")]
    BadSignature,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("Invalid membership event: {0}")]
    InvalidMembershipEvent(String),
}

/// Reassembly outcomes other than success. All of them are expected on the
/// receive path and are recoverable by waiting for more chunks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentationError {
    #[error("message segments incomplete")]
    Incomplete,

    #[error("message segments already completed")]
    AlreadyCompleted,

    #[error("invalid segments count")]
    InvalidCount,

    #[error("hash of entire payload does not match")]
    HashMismatch,

    #[error("invalid parity segments")]
    InvalidParity,

    #[error("erasure coding failed: {0}")]
    Coding(String),

    #[error("malformed segment: {0}")]
    Malformed(String),
}

impl From<reed_solomon_erasure::Error> for SegmentationError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        SegmentationError::Coding(err.to_string())
    }
}
