//! Local event cache consumed by sync.
//!
//! [`CacheAdapter`] is the seam between sync and whatever persists events
//! and relay status. [`MemoryCache`] keeps everything in process and is what
//! the CLI and tests use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// Stored status of one relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub url: String,
    /// Unix milliseconds of the last successful connection
    pub last_connected_at: Option<u64>,
    pub consecutive_failures: u32,
    /// Free-form metadata keyed by namespace
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Partial relay status update.
///
/// Unset fields are left alone. Each metadata namespace is replaced as a
/// whole; `None` removes it. Namespaces not mentioned are untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStatusUpdate {
    pub last_connected_at: Option<u64>,
    pub consecutive_failures: Option<u32>,
    pub metadata: HashMap<String, Option<Value>>,
}

impl RelayStatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one metadata namespace.
    pub fn metadata(mut self, namespace: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(namespace.into(), Some(value));
        self
    }

    /// Remove one metadata namespace.
    pub fn remove_metadata(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.insert(namespace.into(), None);
        self
    }

    /// Apply this update to `status`.
    pub fn apply_to(self, status: &mut RelayStatus) {
        if let Some(at) = self.last_connected_at {
            status.last_connected_at = Some(at);
        }
        if let Some(failures) = self.consecutive_failures {
            status.consecutive_failures = failures;
        }
        for (namespace, value) in self.metadata {
            match value {
                Some(value) => {
                    status.metadata.insert(namespace, value);
                }
                None => {
                    status.metadata.remove(&namespace);
                }
            }
        }
    }
}

/// Storage consumed by sync: event queries, event writes and relay status.
///
/// Writes must be idempotent upserts; sync calls them concurrently from
/// several relay sessions.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Events matching any of the NIP-01 `filters`.
    async fn query(&self, filters: &[Value]) -> Result<Vec<Event>>;

    /// Store an event seen for `filters`, optionally noting the relay it came from.
    async fn set_event(&self, event: &Event, filters: &[Value], relay_url: Option<&str>)
    -> Result<()>;

    async fn get_relay_status(&self, url: &str) -> Result<Option<RelayStatus>>;

    /// Merge `update` into the stored status for `url`, creating it if needed.
    async fn update_relay_status(&self, url: &str, update: RelayStatusUpdate) -> Result<()>;
}

/// In-memory [`CacheAdapter`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    events: RwLock<HashMap<String, Event>>,
    seen_on: RwLock<HashMap<String, HashSet<String>>>,
    relay_status: RwLock<HashMap<String, RelayStatus>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache preloaded with `events`.
    pub fn with_events(events: impl IntoIterator<Item = Event>) -> Self {
        let events = events
            .into_iter()
            .map(|event| (event.id.clone(), event))
            .collect();
        Self {
            events: RwLock::new(events),
            ..Self::default()
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.events.read().await.contains_key(id)
    }

    /// Relays an event has been stored from.
    pub async fn seen_on(&self, id: &str) -> Vec<String> {
        let mut relays: Vec<String> = self
            .seen_on
            .read()
            .await
            .get(id)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default();
        relays.sort();
        relays
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn query(&self, filters: &[Value]) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut seen = HashSet::new();
        let mut matched = Vec::new();

        for filter in filters {
            let mut hits: Vec<&Event> = events
                .values()
                .filter(|event| filter_matches(filter, event))
                .collect();
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            if let Some(limit) = filter.get("limit").and_then(Value::as_u64) {
                hits.truncate(limit as usize);
            }
            for event in hits {
                if seen.insert(event.id.as_str()) {
                    matched.push(event.clone());
                }
            }
        }
        Ok(matched)
    }

    async fn set_event(
        &self,
        event: &Event,
        _filters: &[Value],
        relay_url: Option<&str>,
    ) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.id.clone())
            .or_insert_with(|| event.clone());
        if let Some(url) = relay_url {
            self.seen_on
                .write()
                .await
                .entry(event.id.clone())
                .or_default()
                .insert(url.to_string());
        }
        Ok(())
    }

    async fn get_relay_status(&self, url: &str) -> Result<Option<RelayStatus>> {
        Ok(self.relay_status.read().await.get(url).cloned())
    }

    async fn update_relay_status(&self, url: &str, update: RelayStatusUpdate) -> Result<()> {
        let mut statuses = self.relay_status.write().await;
        let status = statuses.entry(url.to_string()).or_insert_with(|| RelayStatus {
            url: url.to_string(),
            ..RelayStatus::default()
        });
        update.apply_to(status);
        Ok(())
    }
}

/// Whether `event` matches one NIP-01 filter object.
///
/// `limit` is ignored here; it applies to a whole query.
pub fn filter_matches(filter: &Value, event: &Event) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };

    for (key, value) in filter {
        let matches = match key.as_str() {
            "ids" => string_list_contains(value, &event.id),
            "authors" => string_list_contains(value, &event.pubkey),
            "kinds" => value.as_array().is_some_and(|kinds| {
                kinds
                    .iter()
                    .any(|kind| kind.as_u64() == Some(u64::from(event.kind)))
            }),
            "since" => value.as_u64().is_none_or(|since| event.created_at >= since),
            "until" => value.as_u64().is_none_or(|until| event.created_at <= until),
            tag if tag.len() == 2 && tag.starts_with('#') => {
                let wanted: Vec<&str> = value
                    .as_array()
                    .map(|values| values.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                event
                    .tag_values(&tag[1..])
                    .any(|tag_value| wanted.contains(&tag_value))
            }
            _ => true,
        };
        if !matches {
            return false;
        }
    }
    true
}

fn string_list_contains(list: &Value, needle: &str) -> bool {
    list.as_array()
        .is_some_and(|items| items.iter().any(|item| item.as_str() == Some(needle)))
}
