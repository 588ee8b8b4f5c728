//! Relay pool shared by sync calls.

use crate::error::{ClientError, Result};
use crate::relay::{RelayConfig, RelayConnection};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
        }
    }
}

/// Minimal multi-relay pool.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    config: PoolConfig,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Add relay URL to pool (not connected until `connect_all` or `connect_relay`).
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let mut relays = self.relays.write().await;
        if relays.contains_key(url) {
            return Ok(());
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::Internal(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        let relay = RelayConnection::with_config(url, self.config.relay_config.clone())?;
        relays.insert(url.to_string(), Arc::new(relay));
        Ok(())
    }

    /// Connect a specific relay.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let relay = self
            .relays
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown relay: {}", url)))?;
        relay.connect().await
    }

    /// Connect all relays concurrently.
    ///
    /// Succeeds when at least one relay connected.
    pub async fn connect_all(&self) -> Result<()> {
        let relays = self.relays().await;
        let results = join_all(relays.iter().map(|relay| relay.connect())).await;
        let mut successful = 0usize;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(()) | Err(ClientError::AlreadyConnected) => successful += 1,
                Err(error) => debug!("relay {} connect failed: {}", relay.url(), error),
            }
        }
        if successful == 0 {
            return Err(ClientError::Connection(
                "failed to connect to any relay".to_string(),
            ));
        }
        Ok(())
    }

    /// Disconnect all relays.
    pub async fn disconnect_all(&self) -> Result<()> {
        for relay in self.relays().await {
            relay.disconnect().await?;
        }
        Ok(())
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.relays.read().await.get(url).cloned()
    }

    /// Every relay in the pool, connected or not.
    pub async fn relays(&self) -> Vec<Arc<RelayConnection>> {
        let mut relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        relays.sort_by(|a, b| a.url().cmp(b.url()));
        relays
    }
}
