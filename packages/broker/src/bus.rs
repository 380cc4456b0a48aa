//! Pub/sub control bus.
//!
//! Control nodes publish administrative commands on named topics; every
//! worker node holding a subscription receives them. Delivery is
//! best-effort: subscribers that fall behind lose messages.

use std::collections::HashSet;

use tokio::sync::broadcast;

use crate::queue::{BrokerError, BrokerFuture};

/// Broadcast channel capacity for control messages.
const BUS_CHANNEL_CAPACITY: usize = 256;

/// A raw message as carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber lagged, {0} messages skipped")]
    Lagged(u64),

    #[error("control bus closed")]
    Closed,
}

/// Pub/sub transport for control commands.
pub trait ControlBus: Send + Sync + 'static {
    /// Publish a payload; succeeds even when nobody is listening.
    fn publish(&self, topic: &str, payload: String) -> BrokerFuture<'_, ()>;

    /// Subscribe to a set of topics.
    fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BrokerError>;
}

/// Receiving side of a bus subscription, filtered to its topics.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    topics: HashSet<String>,
}

impl Subscription {
    /// Wrap a broadcast receiver carrying every bus message.
    pub fn new(rx: broadcast::Receiver<BusMessage>, topics: &[&str]) -> Self {
        Self {
            rx,
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Wait for the next message on one of the subscribed topics.
    pub async fn recv(&mut self) -> Result<BusMessage, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.topics.contains(&msg.topic) => return Ok(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(SubscriptionError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}

/// In-process [`ControlBus`] backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ControlBus for MemoryBus {
    fn publish(&self, topic: &str, payload: String) -> BrokerFuture<'_, ()> {
        let msg = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        Box::pin(async move {
            // No receivers is not an error for fire-and-forget commands.
            if self.tx.send(msg).is_err() {
                tracing::debug!("Control message published with no subscribers");
            }
            Ok(())
        })
    }

    fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BrokerError> {
        Ok(Subscription::new(self.tx.subscribe(), topics))
    }
}
