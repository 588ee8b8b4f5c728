//! Live subscription with background negentropy backfill.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use nostr::Event;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::capability::CapabilityCache;
use super::orchestrator::{NegentropySync, RelayOutcome, SyncOptions};
use super::transport::SyncRelay;
use crate::cache::CacheAdapter;
use crate::error::Result;
use crate::subscription::EVENT_CHANNEL_CAPACITY;

pub type RelaySyncedCallback = Arc<dyn Fn(&str, usize) + Send + Sync>;
pub type SyncCompleteCallback = Arc<dyn Fn() + Send + Sync>;

/// Options for [`NegentropySync::sync_and_subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Relay selection and timeouts for the backfill
    pub sync: SyncOptions,
    /// Called with the number of backfilled events after each relay
    pub on_relay_synced: Option<RelaySyncedCallback>,
    /// Called once after every relay finished or gave up
    pub on_sync_complete: Option<SyncCompleteCallback>,
}

impl SubscribeOptions {
    pub fn on_relay_synced(
        mut self,
        callback: impl Fn(&str, usize) + Send + Sync + 'static,
    ) -> Self {
        self.on_relay_synced = Some(Arc::new(callback));
        self
    }

    pub fn on_sync_complete(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_sync_complete = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("sync", &self.sync)
            .field("on_relay_synced", &self.on_relay_synced.is_some())
            .field("on_sync_complete", &self.on_sync_complete.is_some())
            .finish()
    }
}

/// Live event stream fed by relay subscriptions and backfill.
///
/// Every event is delivered once, whichever path found it first.
pub struct SyncSubscription {
    id: String,
    events: mpsc::Receiver<Event>,
    relays: Vec<Arc<dyn SyncRelay>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    /// Close the live subscription on every relay and abort the backfill.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for relay in std::mem::take(&mut self.relays) {
            if relay.is_connected()
                && let Err(error) = relay.unsubscribe(&self.id).await
            {
                debug!("closing {} on {} failed: {}", self.id, relay.url(), error);
            }
        }
        self.events.close();
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl NegentropySync {
    /// Subscribe to new events matching `filters` and backfill history.
    ///
    /// Returns immediately. Each relay first gets a live subscription with
    /// `limit: 0`, then a background backfill: negentropy where the relay
    /// supports it, a plain `REQ` where it is known not to. Backfilled
    /// events are written to the cache and delivered on the same stream.
    pub fn sync_and_subscribe(
        &self,
        filters: Vec<Value>,
        options: SubscribeOptions,
    ) -> Result<SyncSubscription> {
        let relays = self.resolve_relays(&options.sync)?;
        let id = format!("sync-{:016x}", rand::random::<u64>());

        let (raw_tx, raw_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(forward_unique(raw_rx, out_tx));

        let live_filters: Vec<Value> = filters.iter().map(live_filter).collect();
        let connect_timeout = options
            .sync
            .connect_timeout
            .unwrap_or(self.config().connect_timeout);

        if self.cache().is_none() {
            warn!("sync_and_subscribe without a cache adapter; backfill skipped");
            if let Some(callback) = &options.on_sync_complete {
                callback();
            }
        }

        let sync = self.clone();
        let subscription_id = id.clone();
        let task_relays = relays.clone();
        let backfill = tokio::spawn(async move {
            join_all(task_relays.into_iter().map(|relay| {
                let sync = sync.clone();
                let filters = filters.clone();
                let live_filters = live_filters.clone();
                let subscription_id = subscription_id.clone();
                let raw_tx = raw_tx.clone();
                let options = options.clone();
                async move {
                    if let Err(error) = relay.wait_until_connected(connect_timeout).await {
                        warn!(
                            "relay {} never connected for {}: {}",
                            relay.url(),
                            subscription_id,
                            error
                        );
                        return;
                    }
                    if let Err(error) = relay
                        .subscribe_live(&subscription_id, live_filters, raw_tx.clone())
                        .await
                    {
                        warn!("live subscription on {} failed: {}", relay.url(), error);
                    }
                    if sync.cache().is_none() {
                        return;
                    }

                    let count =
                        backfill_relay(&sync, &relay, filters, &options.sync, &raw_tx).await;
                    if let Some(callback) = &options.on_relay_synced {
                        callback(relay.url(), count);
                    }
                }
            }))
            .await;

            if sync.cache().is_some() {
                info!("backfill for {} finished", subscription_id);
                if let Some(callback) = &options.on_sync_complete {
                    callback();
                }
            }
        });

        Ok(SyncSubscription {
            id,
            events: out_rx,
            relays,
            tasks: vec![backfill, forwarder],
        })
    }
}

/// Backfill one relay and push what was found into the stream.
async fn backfill_relay(
    sync: &NegentropySync,
    relay: &Arc<dyn SyncRelay>,
    filters: Vec<Value>,
    base: &SyncOptions,
    raw_tx: &mpsc::Sender<Event>,
) -> usize {
    let Some(cache) = sync.cache().cloned() else {
        return 0;
    };
    let capabilities = CapabilityCache::new(Arc::clone(&cache), sync.config().capability_ttl);
    let fetch_timeout = base.fetch_timeout.unwrap_or(sync.config().fetch_timeout);

    if known_unsupported(&capabilities, relay.url()).await {
        return fallback_fetch(relay, &filters, fetch_timeout, &cache, raw_tx).await;
    }

    let options = SyncOptions {
        relays: Some(vec![Arc::clone(relay)]),
        relay_urls: None,
        auto_fetch: Some(true),
        ..base.clone()
    };
    let result = match sync.sync(filters.clone(), options).await {
        Ok(result) => result,
        Err(error) => {
            warn!("backfill via negentropy on {} failed: {}", relay.url(), error);
            return fallback_fetch(relay, &filters, fetch_timeout, &cache, raw_tx).await;
        }
    };

    let synced = result
        .reports
        .iter()
        .all(|report| report.outcome == RelayOutcome::Synced);
    if !synced && known_unsupported(&capabilities, relay.url()).await {
        return fallback_fetch(relay, &filters, fetch_timeout, &cache, raw_tx).await;
    }

    let count = result.events.len();
    for event in result.events {
        if raw_tx.send(event).await.is_err() {
            break;
        }
    }
    count
}

async fn known_unsupported(capabilities: &CapabilityCache, url: &str) -> bool {
    matches!(
        capabilities.fresh(url).await,
        Ok(Some(capability)) if !capability.supports_negentropy
    )
}

/// Plain `REQ` backfill for relays without negentropy.
async fn fallback_fetch(
    relay: &Arc<dyn SyncRelay>,
    filters: &[Value],
    wait: Duration,
    cache: &Arc<dyn CacheAdapter>,
    raw_tx: &mpsc::Sender<Event>,
) -> usize {
    debug!("falling back to REQ backfill on {}", relay.url());
    let events = match relay.fetch_events(filters.to_vec(), wait).await {
        Ok(events) => events,
        Err(error) => {
            warn!("fallback fetch from {} failed: {}", relay.url(), error);
            return 0;
        }
    };

    let count = events.len();
    for event in events {
        if let Err(error) = cache.set_event(&event, filters, Some(relay.url())).await {
            debug!("caching {} failed: {}", event.id, error);
        }
        if raw_tx.send(event).await.is_err() {
            break;
        }
    }
    count
}

/// Forward events from `raw` to `out`, dropping ids already forwarded.
async fn forward_unique(mut raw: mpsc::Receiver<Event>, out: mpsc::Sender<Event>) {
    let mut seen = HashSet::new();
    while let Some(event) = raw.recv().await {
        if seen.insert(event.id.clone()) && out.send(event).await.is_err() {
            break;
        }
    }
}

/// Copy of `filter` that only matches events published from now on.
fn live_filter(filter: &Value) -> Value {
    match filter {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("limit".to_string(), json!(0));
            Value::Object(fields)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: String::new(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn live_filter_sets_zero_limit() {
        assert_eq!(
            live_filter(&json!({"kinds": [1], "limit": 50})),
            json!({"kinds": [1], "limit": 0})
        );
        assert_eq!(live_filter(&json!({})), json!({"limit": 0}));
    }

    #[tokio::test]
    async fn forwarder_drops_duplicates() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let task = tokio::spawn(forward_unique(raw_rx, out_tx));

        for id in ["a", "b", "a", "c", "b"] {
            raw_tx.send(event(id)).await.unwrap();
        }
        drop(raw_tx);
        task.await.unwrap();

        let mut ids = Vec::new();
        while let Some(event) = out_rx.recv().await {
            ids.push(event.id);
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
