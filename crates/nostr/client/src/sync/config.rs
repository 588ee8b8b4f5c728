use std::env;
use std::time::Duration;

use nostr::FRAME_SIZE_LIMIT_MINIMUM;
use thiserror::Error;

use super::capability::DEFAULT_CAPABILITY_TTL;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FRAME_SIZE_LIMIT: u64 = 50_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid NOSTR_SYNC_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid NOSTR_SYNC_SESSION_TIMEOUT_MS: {0}")]
    InvalidSessionTimeout(String),
    #[error("invalid NOSTR_SYNC_FETCH_TIMEOUT_MS: {0}")]
    InvalidFetchTimeout(String),
    #[error("invalid NOSTR_SYNC_FRAME_SIZE_LIMIT: {0}")]
    InvalidFrameSizeLimit(String),
    #[error("invalid NOSTR_SYNC_AUTO_FETCH: {0}")]
    InvalidAutoFetch(String),
    #[error("invalid NOSTR_SYNC_CAPABILITY_TTL_SECONDS: {0}")]
    InvalidCapabilityTtl(String),
}

/// Defaults applied to every sync call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long to wait for a relay to connect before skipping it
    pub connect_timeout: Duration,
    /// Upper bound on one negentropy session
    pub session_timeout: Duration,
    /// Upper bound on one auto-fetch or fallback `REQ`
    pub fetch_timeout: Duration,
    /// 0 disables the limit
    pub frame_size_limit: u64,
    pub auto_fetch: bool,
    pub capability_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            frame_size_limit: DEFAULT_FRAME_SIZE_LIMIT,
            auto_fetch: true,
            capability_ttl: DEFAULT_CAPABILITY_TTL,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from defaults overridden by whatever `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let connect_timeout = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_CONNECT_TIMEOUT_MS",
            defaults.connect_timeout,
            |raw| parse_millis(&raw).map_err(ConfigError::InvalidConnectTimeout),
        )?;
        let session_timeout = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_SESSION_TIMEOUT_MS",
            defaults.session_timeout,
            |raw| parse_millis(&raw).map_err(ConfigError::InvalidSessionTimeout),
        )?;
        let fetch_timeout = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_FETCH_TIMEOUT_MS",
            defaults.fetch_timeout,
            |raw| parse_millis(&raw).map_err(ConfigError::InvalidFetchTimeout),
        )?;
        let frame_size_limit = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_FRAME_SIZE_LIMIT",
            defaults.frame_size_limit,
            |raw| {
                let limit = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidFrameSizeLimit(error.to_string()))?;
                if limit != 0 && limit < FRAME_SIZE_LIMIT_MINIMUM {
                    return Err(ConfigError::InvalidFrameSizeLimit(format!(
                        "{limit} is below the minimum of {FRAME_SIZE_LIMIT_MINIMUM}"
                    )));
                }
                Ok(limit)
            },
        )?;
        let auto_fetch = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_AUTO_FETCH",
            defaults.auto_fetch,
            |raw| parse_bool(&raw).map_err(ConfigError::InvalidAutoFetch),
        )?;
        let capability_ttl = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_CAPABILITY_TTL_SECONDS",
            defaults.capability_ttl,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|error| ConfigError::InvalidCapabilityTtl(error.to_string()))
            },
        )?;

        Ok(Self {
            connect_timeout,
            session_timeout,
            fetch_timeout,
            frame_size_limit,
            auto_fetch,
            capability_ttl,
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_millis(raw: &str) -> Result<Duration, String> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(millis) => Ok(Duration::from_millis(millis)),
        Err(error) => Err(error.to_string()),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
