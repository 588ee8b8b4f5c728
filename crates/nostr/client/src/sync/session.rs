//! One negentropy session against one relay.
//!
//! The session takes the initiator role: it sends `NEG-OPEN`, then answers
//! every `NEG-MSG` with the next round until the engine has nothing left to
//! ask. Rounds strictly alternate; nothing is pipelined.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr::nip77::decode_hex_payload;
use nostr::{NegMsg, NegOpen, Negentropy, NegentropyStorage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

use super::transport::SyncRelay;
use crate::error::{ClientError, Result};
use crate::relay::NegentropyReply;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Opening message being built and sent
    Initial,
    AwaitingResponse,
    /// Processing a reply and building the next round
    Reconciling,
    Done,
    TimedOut,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::TimedOut | Self::Errored)
    }
}

/// Traffic counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Replies processed
    pub rounds: usize,
    /// Binary payload bytes sent, before hex encoding
    pub bytes_sent: usize,
    /// Binary payload bytes received, after hex decoding
    pub bytes_received: usize,
}

/// What a finished session learned.
///
/// `need` and `have` hold hex event ids. They are valid even when the
/// session timed out or failed; in that case they are partial.
#[derive(Debug)]
pub struct SessionOutcome {
    pub url: String,
    pub state: SessionState,
    pub need: HashSet<String>,
    pub have: HashSet<String>,
    pub stats: SessionStats,
    pub error: Option<ClientError>,
}

impl SessionOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Done
    }
}

/// A single initiator-side reconciliation against `relay`.
pub struct SyncSession {
    relay: Arc<dyn SyncRelay>,
    engine: Negentropy,
    filter: Value,
    timeout: Duration,
    subscription_id: String,
    state: SessionState,
    stats: SessionStats,
    need: HashSet<String>,
    have: HashSet<String>,
}

impl SyncSession {
    pub fn new(
        relay: Arc<dyn SyncRelay>,
        storage: NegentropyStorage,
        filter: Value,
        frame_size_limit: u64,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            relay,
            engine: Negentropy::new(storage, frame_size_limit)?,
            filter,
            timeout,
            subscription_id: format!("neg-{:016x}", rand::random::<u64>()),
            state: SessionState::Idle,
            stats: SessionStats::default(),
            need: HashSet::new(),
            have: HashSet::new(),
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run to completion, timeout or failure. Always sends `NEG-CLOSE`.
    pub async fn run(mut self) -> SessionOutcome {
        let deadline = Instant::now() + self.timeout;
        let error = match timeout_at(deadline, self.exchange()).await {
            Ok(Ok(())) => None,
            Ok(Err(error)) => {
                self.state = SessionState::Errored;
                Some(error)
            }
            Err(_) => {
                self.state = SessionState::TimedOut;
                Some(ClientError::Timeout(format!(
                    "negentropy session with {} exceeded {:?}",
                    self.relay.url(),
                    self.timeout
                )))
            }
        };

        self.relay.close_negentropy(&self.subscription_id).await;

        info!(
            relay = self.relay.url(),
            state = ?self.state,
            rounds = self.stats.rounds,
            need = self.need.len(),
            have = self.have.len(),
            "negentropy session finished"
        );

        SessionOutcome {
            url: self.relay.url().to_string(),
            state: self.state,
            need: self.need,
            have: self.have,
            stats: self.stats,
            error,
        }
    }

    async fn exchange(&mut self) -> Result<()> {
        self.state = SessionState::Initial;
        let mut replies = self.relay.open_negentropy(&self.subscription_id).await?;

        let initial = self.engine.initiate()?;
        let open = NegOpen::new(self.subscription_id.clone(), self.filter.clone(), &initial);
        self.send(&open.to_json(), initial.len()).await?;

        loop {
            self.state = SessionState::AwaitingResponse;
            let payload = self.next_payload(&mut replies).await?;

            self.state = SessionState::Reconciling;
            let bytes = decode_hex_payload(&payload)?;
            self.stats.rounds += 1;
            self.stats.bytes_received += bytes.len();

            let output = self.engine.reconcile(&bytes)?;
            self.need.extend(output.need.iter().map(hex::encode));
            self.have.extend(output.have.iter().map(hex::encode));

            let Some(next) = output.next_message else {
                self.state = SessionState::Done;
                return Ok(());
            };
            let message = NegMsg::new(self.subscription_id.clone(), &next);
            self.send(&message.to_json(), next.len()).await?;
        }
    }

    async fn next_payload(
        &self,
        replies: &mut mpsc::UnboundedReceiver<NegentropyReply>,
    ) -> Result<String> {
        loop {
            match replies.recv().await {
                Some(NegentropyReply::Message(payload)) => return Ok(payload),
                Some(NegentropyReply::Error(reason)) => {
                    return Err(ClientError::Unsupported(format!("NEG-ERR: {}", reason)));
                }
                Some(NegentropyReply::Notice(text)) if is_unsupported_notice(&text) => {
                    return Err(ClientError::Unsupported(format!("NOTICE: {}", text)));
                }
                Some(NegentropyReply::Notice(text)) => {
                    debug!("ignoring notice from {}: {}", self.relay.url(), text);
                }
                None => {
                    return Err(ClientError::Connection(format!(
                        "{} dropped the negentropy session",
                        self.relay.url()
                    )));
                }
            }
        }
    }

    async fn send(&mut self, frame: &Value, payload_len: usize) -> Result<()> {
        debug!(
            relay = self.relay.url(),
            subscription = %self.subscription_id,
            bytes = payload_len,
            "sending negentropy round"
        );
        self.relay.send_json(frame).await?;
        self.stats.bytes_sent += payload_len;
        Ok(())
    }
}

/// Whether a `NOTICE` says the relay does not understand negentropy frames.
pub fn is_unsupported_notice(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("negentropy")
        || text.contains("neg-open")
        || text.contains("neg-msg")
        || text.contains("bad msg")
        || text.contains("bad message")
        || (text.contains("unknown") && text.contains("msg"))
        || (text.contains("unsupported") && text.contains("protocol"))
}
