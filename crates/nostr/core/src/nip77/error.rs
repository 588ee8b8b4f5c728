use thiserror::Error;

/// NIP-77 error types
#[derive(Debug, Error)]
pub enum Nip77Error {
    #[error("Invalid protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid mode: {0}")]
    InvalidMode(u64),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Varint decode error: {0}")]
    VarintDecode(String),

    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid fingerprint length: expected 16, got {0}")]
    InvalidFingerprintLength(usize),

    #[error("Invalid ID length: expected 32, got {0}")]
    InvalidIdLength(usize),

    #[error("Invalid message envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Frame size limit too small: {0} (minimum 4096)")]
    FrameSizeLimitTooSmall(u64),

    #[error("Reconciliation already initiated")]
    AlreadyInitiated,
}

pub type Result<T> = std::result::Result<T, Nip77Error>;
