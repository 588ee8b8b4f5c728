//! Subscription management for receiving filtered events.

use crate::error::{ClientError, Result};
use nostr::Event;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};

/// Default capacity of a subscription's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A subscription to filtered events from a relay.
#[derive(Clone)]
pub struct Subscription {
    /// Subscription ID.
    pub id: String,
    /// Filters for this subscription.
    pub filters: Vec<Value>,
    eose_received: Arc<AtomicBool>,
    eose_notify: Arc<Notify>,
    event_tx: Option<mpsc::Sender<Event>>,
}

impl Subscription {
    /// Create a new subscription with filters.
    pub fn new(id: String, filters: Vec<Value>) -> Self {
        Self {
            id,
            filters,
            eose_received: Arc::new(AtomicBool::new(false)),
            eose_notify: Arc::new(Notify::new()),
            event_tx: None,
        }
    }

    /// Create a subscription that receives events on a bounded channel.
    pub fn with_channel(id: String, filters: Vec<Value>) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self::with_sender(id, filters, tx), rx)
    }

    /// Create a subscription that feeds an existing channel.
    ///
    /// Several subscriptions (one per relay) may share one sender.
    pub fn with_sender(id: String, filters: Vec<Value>, sender: mpsc::Sender<Event>) -> Self {
        Self {
            event_tx: Some(sender),
            ..Self::new(id, filters)
        }
    }

    /// Handle a received event.
    pub fn handle_event(&self, event: Event) -> Result<()> {
        if let Some(tx) = &self.event_tx {
            tx.try_send(event).map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => {
                    ClientError::Subscription("event channel full - consumer too slow".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ClientError::Subscription("event channel closed".to_string())
                }
            })?;
        }

        Ok(())
    }

    /// Mark EOSE as received and wake a waiter.
    pub fn mark_eose(&self) {
        self.eose_received.store(true, Ordering::Release);
        self.eose_notify.notify_one();
    }

    /// Check if EOSE has been received.
    pub fn has_eose(&self) -> bool {
        self.eose_received.load(Ordering::Acquire)
    }

    /// Wait until EOSE has been received.
    pub async fn eose(&self) {
        if self.has_eose() {
            return;
        }
        self.eose_notify.notified().await;
    }
}
