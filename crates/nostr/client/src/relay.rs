//! Single relay connection management.

use crate::error::{ClientError, Result};
use crate::subscription::Subscription;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use nostr::Event;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type Subscriptions = Arc<Mutex<HashMap<String, Subscription>>>;
type NegentropySessions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<NegentropyReply>>>>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Closed(String, String),
    Notice(String),
    Auth(String),
    NegMsg(String, String),
    NegErr(String, String),
}

/// Frame delivered to the negentropy session owning a subscription id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegentropyReply {
    /// Hex payload of a `NEG-MSG`
    Message(String),
    /// Reason from a `NEG-ERR` or a `CLOSED` on the session id
    Error(String),
    /// Any `NOTICE` seen while the session is open
    Notice(String),
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Relay connection.
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    subscriptions: Subscriptions,
    neg_sessions: NegentropySessions,
    recv_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            url: parsed_url,
            config,
            state: Arc::new(state),
            writer: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            neg_sessions: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `Connected`.
    pub async fn wait_until_connected(&self, wait: Duration) -> Result<()> {
        let mut state = self.state.subscribe();
        timeout(
            wait,
            state.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .map_err(|_| {
            ClientError::Timeout(format!("{} did not connect within {:?}", self.url, wait))
        })?
        .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }

    /// Connect to relay and start background receive loop.
    pub async fn connect(&self) -> Result<()> {
        let previous = self.state.send_replace(ConnectionState::Connecting);
        if previous == ConnectionState::Connected {
            self.state.send_replace(previous);
            return Err(ClientError::AlreadyConnected);
        }

        let connect_result = match timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(error)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(ClientError::WebSocket(error.to_string()));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (stream, _response) = connect_result;
        let (writer, mut reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        self.state.send_replace(ConnectionState::Connected);

        let subscriptions = Arc::clone(&self.subscriptions);
        let neg_sessions = Arc::clone(&self.neg_sessions);
        let state = Arc::clone(&self.state);
        let relay_url = self.url.to_string();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_relay_message(text.as_str()) {
                        Ok(Some(message)) => {
                            route_message(message, &subscriptions, &neg_sessions, &relay_url)
                                .await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("protocol parse error on {}: {}", relay_url, error);
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", relay_url, error);
                        break;
                    }
                }
            }

            // Dropping the senders tells open sessions the relay went away.
            neg_sessions.lock().await.clear();
            state.send_replace(ConnectionState::Disconnected);
            debug!("relay {} disconnected", relay_url);
        });

        *self.recv_task.lock().await = Some(task);
        Ok(())
    }

    /// Disconnect from relay and stop background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer
                .send(Message::Close(None))
                .await
                .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        }

        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }

        self.neg_sessions.lock().await.clear();
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    /// Register and send subscription request.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let request = json!(["REQ", subscription.id, subscription.filters]);
        let id = subscription.id.clone();
        self.subscriptions
            .lock()
            .await
            .insert(id.clone(), subscription);

        if let Err(error) = self.send_json(&request).await {
            self.subscriptions.lock().await.remove(&id);
            return Err(error);
        }
        Ok(())
    }

    /// Subscribe with raw filters.
    pub async fn subscribe_filters(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Value>,
    ) -> Result<()> {
        self.subscribe(Subscription::new(subscription_id.into(), filters))
            .await
    }

    /// Close subscription on relay.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(subscription_id);
        self.send_json(&json!(["CLOSE", subscription_id])).await
    }

    /// Run a one-shot `REQ` and collect events until `EOSE`, `CLOSED` or `wait`.
    ///
    /// Hitting `wait` is not an error; whatever arrived is returned.
    pub async fn fetch_events(&self, filters: Vec<Value>, wait: Duration) -> Result<Vec<Event>> {
        let subscription_id = format!("fetch-{:016x}", rand::random::<u64>());
        let (subscription, mut events_rx) = Subscription::with_channel(subscription_id, filters);
        let done = subscription.clone();
        let id = subscription.id.clone();
        self.subscribe(subscription).await?;

        let mut events = Vec::new();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                maybe_event = events_rx.recv() => match maybe_event {
                    Some(event) => events.push(event),
                    None => break,
                },
                () = done.eose() => break,
                () = &mut deadline => {
                    debug!("fetch {} on {} hit {:?} before EOSE", id, self.url, wait);
                    break;
                }
            }
        }
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }

        if let Err(error) = self.unsubscribe(&id).await {
            debug!("closing fetch {} on {} failed: {}", id, self.url, error);
        }
        Ok(events)
    }

    /// Route `NEG-MSG` / `NEG-ERR` / `NOTICE` frames for `subscription_id` to
    /// the returned receiver. The receiver closes when the relay disconnects.
    pub async fn open_negentropy(
        &self,
        subscription_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<NegentropyReply>> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.neg_sessions
            .lock()
            .await
            .insert(subscription_id.to_string(), tx);
        Ok(rx)
    }

    /// Stop routing for `subscription_id` and send `NEG-CLOSE` if still connected.
    pub async fn close_negentropy(&self, subscription_id: &str) {
        let was_open = self
            .neg_sessions
            .lock()
            .await
            .remove(subscription_id)
            .is_some();
        if was_open && self.state() == ConnectionState::Connected {
            let close = nostr::NegClose::new(subscription_id.to_string()).to_json();
            if let Err(error) = self.send_json(&close).await {
                debug!("NEG-CLOSE to {} failed: {}", self.url, error);
            }
        }
    }

    /// Serialize and send a JSON frame.
    pub async fn send_json(&self, value: &Value) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }
}

async fn route_message(
    message: RelayMessage,
    subscriptions: &Subscriptions,
    neg_sessions: &NegentropySessions,
    relay_url: &str,
) {
    match message {
        RelayMessage::Event(subscription_id, event) => {
            let subscription = { subscriptions.lock().await.get(&subscription_id).cloned() };
            if let Some(subscription) = subscription
                && let Err(error) = subscription.handle_event(event)
            {
                warn!("subscription {} on {}: {}", subscription_id, relay_url, error);
            }
        }
        RelayMessage::Eose(subscription_id) => {
            if let Some(subscription) = subscriptions.lock().await.get(&subscription_id) {
                subscription.mark_eose();
            }
        }
        RelayMessage::Closed(subscription_id, reason) => {
            let error = NegentropyReply::Error(reason.clone());
            if !deliver(neg_sessions, &subscription_id, error).await
                && let Some(subscription) = subscriptions.lock().await.remove(&subscription_id)
            {
                debug!("{} closed {}: {}", relay_url, subscription_id, reason);
                subscription.mark_eose();
            }
        }
        RelayMessage::NegMsg(subscription_id, payload) => {
            if !deliver(neg_sessions, &subscription_id, NegentropyReply::Message(payload)).await {
                debug!("negentropy frame for unknown session {}", subscription_id);
            }
        }
        RelayMessage::NegErr(subscription_id, reason) => {
            if !deliver(neg_sessions, &subscription_id, NegentropyReply::Error(reason)).await {
                debug!("NEG-ERR for unknown session {}", subscription_id);
            }
        }
        RelayMessage::Notice(text) => {
            debug!("notice from {}: {}", relay_url, text);
            neg_sessions.lock().await.retain(|subscription_id, session| {
                let open = session.send(NegentropyReply::Notice(text.clone())).is_ok();
                if !open {
                    trace!("dropping closed negentropy session {}", subscription_id);
                }
                open
            });
        }
        RelayMessage::Ok(event_id, accepted, text) => {
            debug!("OK from {} for {}: {} {}", relay_url, event_id, accepted, text);
        }
        RelayMessage::Auth(_) => {
            debug!("{} requested AUTH; not supported", relay_url);
        }
    }
}

/// Hand `reply` to the session registered under `subscription_id`.
///
/// Returns false when no session is registered. A session whose receiver is
/// gone is unregistered.
async fn deliver(
    sessions: &NegentropySessions,
    subscription_id: &str,
    reply: NegentropyReply,
) -> bool {
    let mut sessions = sessions.lock().await;
    let Some(session) = sessions.get(subscription_id) else {
        return false;
    };
    if session.send(reply).is_err() {
        trace!("dropping closed negentropy session {}", subscription_id);
        sessions.remove(subscription_id);
    }
    true
}

fn string_at(array: &[Value], index: usize, what: &str) -> Result<String> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(format!("invalid {}", what)))
}

fn require_len(array: &[Value], len: usize, kind: &str) -> Result<()> {
    if array.len() < len {
        return Err(ClientError::Protocol(format!("invalid {} message", kind)));
    }
    Ok(())
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    let Some(first) = array.first() else {
        return Ok(None);
    };

    let kind = first
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            require_len(array, 3, "EVENT")?;
            let subscription_id = string_at(array, 1, "EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            require_len(array, 4, "OK")?;
            let event_id = string_at(array, 1, "OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = string_at(array, 3, "OK message text")?;
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            require_len(array, 2, "EOSE")?;
            Ok(Some(RelayMessage::Eose(string_at(
                array,
                1,
                "EOSE subscription id",
            )?)))
        }
        "CLOSED" => {
            require_len(array, 2, "CLOSED")?;
            let subscription_id = string_at(array, 1, "CLOSED subscription id")?;
            let reason = array
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(RelayMessage::Closed(subscription_id, reason)))
        }
        "NOTICE" => {
            require_len(array, 2, "NOTICE")?;
            Ok(Some(RelayMessage::Notice(string_at(
                array,
                1,
                "NOTICE message text",
            )?)))
        }
        "AUTH" => {
            require_len(array, 2, "AUTH")?;
            Ok(Some(RelayMessage::Auth(string_at(
                array,
                1,
                "AUTH challenge",
            )?)))
        }
        "NEG-MSG" => {
            require_len(array, 3, "NEG-MSG")?;
            let subscription_id = string_at(array, 1, "NEG-MSG subscription id")?;
            let payload = string_at(array, 2, "NEG-MSG payload")?;
            Ok(Some(RelayMessage::NegMsg(subscription_id, payload)))
        }
        "NEG-ERR" => {
            require_len(array, 3, "NEG-ERR")?;
            let subscription_id = string_at(array, 1, "NEG-ERR subscription id")?;
            let reason = string_at(array, 2, "NEG-ERR reason")?;
            Ok(Some(RelayMessage::NegErr(subscription_id, reason)))
        }
        _ => Ok(None),
    }
}
