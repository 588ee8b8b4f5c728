//! Per-relay negentropy support verdicts.
//!
//! Verdicts live in the cache adapter's relay status under the `sync`
//! metadata namespace, so clearing them leaves other metadata for the same
//! relay in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheAdapter, RelayStatusUpdate};
use crate::error::{ClientError, Result};

/// Relay status metadata namespace owned by sync.
pub const CAPABILITY_NAMESPACE: &str = "sync";

/// How long a verdict is trusted before the relay is probed again.
pub const DEFAULT_CAPABILITY_TTL: Duration = Duration::from_secs(60 * 60);

/// Whether a relay speaks NIP-77, and when that was last checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCapability {
    pub url: String,
    pub supports_negentropy: bool,
    /// Unix milliseconds
    pub last_checked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RelayCapability {
    pub fn supported(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            supports_negentropy: true,
            last_checked: now_millis(),
            last_error: None,
        }
    }

    pub fn unsupported(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            supports_negentropy: false,
            last_checked: now_millis(),
            last_error: Some(error.into()),
        }
    }

    /// Whether the verdict is younger than `ttl` at `now` (unix ms).
    pub fn is_fresh_at(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.last_checked) < ttl.as_millis() as u64
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.is_fresh_at(ttl, now_millis())
    }
}

/// Current time in unix milliseconds.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Capability verdicts stored through a [`CacheAdapter`].
#[derive(Clone)]
pub struct CapabilityCache {
    cache: Arc<dyn CacheAdapter>,
    ttl: Duration,
}

impl CapabilityCache {
    pub fn new(cache: Arc<dyn CacheAdapter>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stored verdict for `url`, fresh or not.
    ///
    /// A malformed entry reads as absent.
    pub async fn get(&self, url: &str) -> Result<Option<RelayCapability>> {
        let Some(status) = self.cache.get_relay_status(url).await? else {
            return Ok(None);
        };
        let Some(value) = status.metadata.get(CAPABILITY_NAMESPACE) else {
            return Ok(None);
        };
        match serde_json::from_value::<RelayCapability>(value.clone()) {
            Ok(capability) => Ok(Some(capability)),
            Err(error) => {
                debug!("ignoring malformed capability entry for {}: {}", url, error);
                Ok(None)
            }
        }
    }

    /// Stored verdict for `url` if it is still within the TTL.
    pub async fn fresh(&self, url: &str) -> Result<Option<RelayCapability>> {
        Ok(self
            .get(url)
            .await?
            .filter(|capability| capability.is_fresh(self.ttl)))
    }

    pub async fn put(&self, url: &str, capability: &RelayCapability) -> Result<()> {
        if !capability.supports_negentropy {
            warn!(
                "relay {} marked as not supporting negentropy: {}",
                url,
                capability.last_error.as_deref().unwrap_or("unknown reason")
            );
        }
        let value = serde_json::to_value(capability)?;
        self.cache
            .update_relay_status(
                url,
                RelayStatusUpdate::new().metadata(CAPABILITY_NAMESPACE, value),
            )
            .await
    }

    /// Forget the verdict for `url`. Other metadata namespaces survive.
    pub async fn clear(&self, url: &str) -> Result<()> {
        self.cache
            .update_relay_status(
                url,
                RelayStatusUpdate::new().remove_metadata(CAPABILITY_NAMESPACE),
            )
            .await
    }
}

/// Verdict to store for a probe that ended in `error`, if any.
///
/// Liveness failures say nothing about the relay's capabilities.
pub fn verdict_for_failure(url: &str, error: &ClientError) -> Option<RelayCapability> {
    if error.is_liveness() {
        None
    } else {
        Some(RelayCapability::unsupported(url, error.to_string()))
    }
}
