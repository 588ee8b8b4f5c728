//! In-process relay used by the sync integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, NegMsg, NegOpen, Negentropy, NegentropyStorage};
use nostr_client::cache::filter_matches;
use nostr_client::{ClientError, NegentropyReply, Result, SyncRelay};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// How the mock answers negentropy traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Runs a real responder engine
    Negentropy,
    /// Accepts frames and never answers
    Silent,
    /// Answers with a payload carrying a bad version byte
    Garbage,
    /// Answers NEG-OPEN with a NOTICE about unknown messages
    UnsupportedNotice,
    /// Answers NEG-OPEN with NEG-ERR
    NegErr,
    /// Never connects
    Offline,
}

pub struct MockRelay {
    url: String,
    behavior: Behavior,
    events: Mutex<Vec<Event>>,
    engines: Mutex<HashMap<String, Negentropy>>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<NegentropyReply>>>,
    live: Mutex<Vec<(String, mpsc::Sender<Event>)>>,
    opens: AtomicUsize,
    fetches: AtomicUsize,
    ready_at: Option<Instant>,
}

impl MockRelay {
    pub fn new(url: &str, behavior: Behavior, events: Vec<Event>) -> Arc<Self> {
        Self::build(url, behavior, events, None)
    }

    /// A negentropy relay that only becomes connected after `delay`.
    pub fn connecting_after(url: &str, events: Vec<Event>, delay: Duration) -> Arc<Self> {
        Self::build(url, Behavior::Negentropy, events, Some(Instant::now() + delay))
    }

    fn build(
        url: &str,
        behavior: Behavior,
        events: Vec<Event>,
        ready_at: Option<Instant>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            behavior,
            events: Mutex::new(events),
            engines: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            live: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            ready_at,
        })
    }

    /// Number of NEG-OPEN frames received.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn live_subscriptions(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Store a new event and push it to live subscribers.
    pub async fn publish(&self, event: Event) {
        self.events.lock().await.push(event.clone());
        for (_, sender) in self.live.lock().await.iter() {
            let _ = sender.send(event.clone()).await;
        }
    }

    async fn reply(&self, subscription_id: &str, reply: NegentropyReply) {
        if let Some(session) = self.sessions.lock().await.get(subscription_id) {
            let _ = session.send(reply);
        }
    }

    async fn handle_open(&self, frame: &Value) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let open = NegOpen::from_json(frame)?;
        let id = open.subscription_id.clone();

        match self.behavior {
            Behavior::Negentropy => {
                let storage = {
                    let events = self.events.lock().await;
                    let matching: Vec<&Event> = events
                        .iter()
                        .filter(|event| filter_matches(&open.filter, event))
                        .collect();
                    NegentropyStorage::from_events(matching)
                };
                let mut engine = Negentropy::new(storage, 0)?;
                let output = engine.reconcile(&open.payload()?)?;
                self.engines.lock().await.insert(id.clone(), engine);
                if let Some(message) = output.next_message {
                    self.reply(&id, NegentropyReply::Message(hex::encode(message)))
                        .await;
                }
            }
            Behavior::Garbage => {
                self.reply(&id, NegentropyReply::Message("ff00".to_string()))
                    .await;
            }
            Behavior::UnsupportedNotice => {
                self.reply(
                    &id,
                    NegentropyReply::Notice("ERROR: bad msg: unknown cmd".to_string()),
                )
                .await;
            }
            Behavior::NegErr => {
                self.reply(
                    &id,
                    NegentropyReply::Error("blocked: negentropy disabled".to_string()),
                )
                .await;
            }
            Behavior::Silent | Behavior::Offline => {}
        }
        Ok(())
    }

    async fn handle_msg(&self, frame: &Value) -> Result<()> {
        let message = NegMsg::from_json(frame)?;
        let id = message.subscription_id.clone();
        let output = {
            let mut engines = self.engines.lock().await;
            let engine = engines
                .get_mut(&id)
                .ok_or_else(|| ClientError::Protocol(format!("unknown session {id}")))?;
            engine.reconcile(&message.payload()?)?
        };
        if let Some(next) = output.next_message {
            self.reply(&id, NegentropyReply::Message(hex::encode(next)))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncRelay for MockRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.behavior != Behavior::Offline
            && self.ready_at.is_none_or(|ready_at| Instant::now() >= ready_at)
    }

    async fn wait_until_connected(&self, wait: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(ready_at) = self.ready_at
            && self.behavior != Behavior::Offline
            && ready_at <= Instant::now() + wait
        {
            tokio::time::sleep_until(ready_at).await;
            return Ok(());
        }
        tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        Err(ClientError::Timeout(format!("{} is offline", self.url)))
    }

    async fn open_negentropy(
        &self,
        subscription_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<NegentropyReply>> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .await
            .insert(subscription_id.to_string(), tx);
        Ok(rx)
    }

    async fn close_negentropy(&self, subscription_id: &str) {
        self.sessions.lock().await.remove(subscription_id);
        self.engines.lock().await.remove(subscription_id);
    }

    async fn send_json(&self, frame: &Value) -> Result<()> {
        match frame.get(0).and_then(Value::as_str) {
            Some("NEG-OPEN") => self.handle_open(frame).await,
            Some("NEG-MSG") => self.handle_msg(frame).await,
            Some("NEG-CLOSE") => Ok(()),
            other => Err(ClientError::Protocol(format!("unexpected frame {other:?}"))),
        }
    }

    async fn fetch_events(&self, filters: Vec<Value>, _wait: Duration) -> Result<Vec<Event>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|event| filters.iter().any(|filter| filter_matches(filter, event)))
            .cloned()
            .collect())
    }

    async fn subscribe_live(
        &self,
        subscription_id: &str,
        _filters: Vec<Value>,
        sender: mpsc::Sender<Event>,
    ) -> Result<()> {
        self.live
            .lock()
            .await
            .push((subscription_id.to_string(), sender));
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.live
            .lock()
            .await
            .retain(|(id, _)| id != subscription_id);
        Ok(())
    }
}

/// Event `n` with a valid hex id; later `n` are newer.
pub fn event(n: u32) -> Event {
    Event {
        id: format!("{:064x}", n),
        pubkey: "ab".repeat(32),
        created_at: 1_700_000_000 + u64::from(n),
        kind: 1,
        tags: vec![],
        content: format!("note {n}"),
        sig: "00".repeat(64),
    }
}

pub fn id(n: u32) -> String {
    format!("{:064x}", n)
}

pub fn events(range: impl IntoIterator<Item = u32>) -> Vec<Event> {
    range.into_iter().map(event).collect()
}
