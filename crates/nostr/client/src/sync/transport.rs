//! Relay abstraction consumed by the sync engine.
//!
//! The engine never touches WebSocket framing. It opens a negentropy channel
//! keyed by subscription id, sends JSON frames and reads routed replies.
//! [`RelayConnection`] is the production implementation; tests plug in
//! in-process relays.

use std::time::Duration;

use async_trait::async_trait;
use nostr::Event;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;
use crate::relay::{ConnectionState, NegentropyReply, RelayConnection};
use crate::subscription::Subscription;

/// Relay operations needed by sync sessions and sync-and-subscribe.
#[async_trait]
pub trait SyncRelay: Send + Sync {
    /// Normalized relay URL.
    fn url(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Resolve once the relay is connected, or fail after `wait`.
    async fn wait_until_connected(&self, wait: Duration) -> Result<()>;

    /// Start routing negentropy replies for `subscription_id`.
    async fn open_negentropy(
        &self,
        subscription_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<NegentropyReply>>;

    /// Stop routing and tell the relay the session is over.
    async fn close_negentropy(&self, subscription_id: &str);

    async fn send_json(&self, frame: &Value) -> Result<()>;

    /// One-shot `REQ` that returns what arrived before `EOSE` or `wait`.
    async fn fetch_events(&self, filters: Vec<Value>, wait: Duration) -> Result<Vec<Event>>;

    /// Open a long-lived subscription feeding `sender`.
    async fn subscribe_live(
        &self,
        subscription_id: &str,
        filters: Vec<Value>,
        sender: mpsc::Sender<Event>,
    ) -> Result<()>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;
}

#[async_trait]
impl SyncRelay for RelayConnection {
    fn url(&self) -> &str {
        RelayConnection::url(self)
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn wait_until_connected(&self, wait: Duration) -> Result<()> {
        RelayConnection::wait_until_connected(self, wait).await
    }

    async fn open_negentropy(
        &self,
        subscription_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<NegentropyReply>> {
        RelayConnection::open_negentropy(self, subscription_id).await
    }

    async fn close_negentropy(&self, subscription_id: &str) {
        RelayConnection::close_negentropy(self, subscription_id).await;
    }

    async fn send_json(&self, frame: &Value) -> Result<()> {
        RelayConnection::send_json(self, frame).await
    }

    async fn fetch_events(&self, filters: Vec<Value>, wait: Duration) -> Result<Vec<Event>> {
        RelayConnection::fetch_events(self, filters, wait).await
    }

    async fn subscribe_live(
        &self,
        subscription_id: &str,
        filters: Vec<Value>,
        sender: mpsc::Sender<Event>,
    ) -> Result<()> {
        let subscription = Subscription::with_sender(subscription_id.to_string(), filters, sender);
        self.subscribe(subscription).await
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        RelayConnection::unsubscribe(self, subscription_id).await
    }
}

/// Normalize a relay URL the way [`RelayConnection`] stores it.
///
/// Unparseable input is returned unchanged.
pub fn normalize_url(url: &str) -> String {
    Url::parse(url).map_or_else(|_| url.to_string(), |parsed| parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_root_path() {
        assert_eq!(normalize_url("wss://relay.test"), "wss://relay.test/");
        assert_eq!(normalize_url("wss://relay.test/"), "wss://relay.test/");
        assert_eq!(normalize_url("not a url"), "not a url");
    }
}
