//! Client error types.

use nostr::nip77::Nip77Error;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("negentropy error: {0}")]
    Negentropy(#[from] Nip77Error),

    #[error("relay does not support negentropy: {0}")]
    Unsupported(String),

    #[error("No relays available for sync")]
    NoRelays,

    #[error("sync requires a cache adapter")]
    CacheRequired,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this failure says the relay was unreachable rather than
    /// incapable. Liveness failures are retried on the next call.
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::Connection(_) | Self::Timeout(_) | Self::NotConnected
        )
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
