//! Message-bus boundary.
//!
//! The external publish/subscribe transport, specified only at this
//! boundary: at-least-once delivery, no ordering across members, explicit
//! ack/nack per delivered message, string attributes per message.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by the bus boundary.
///
/// A receive-loop error is fatal to that loop; the supervisor decides
/// whether to restart it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The topic's delivery stream ended
    #[error("subscription to topic {0:?} closed")]
    SubscriptionClosed(String),

    /// A publish was not accepted
    #[error("publish to topic {0:?} failed: {1}")]
    PublishFailed(String, String),

    /// The receive loop failed more times than its restart budget allows
    #[error("receive loop {0:?} exhausted its restart budget")]
    RestartBudgetExhausted(String),
}

/// Per-delivery acknowledgement handle.
///
/// Implementations decide what nack means; for an at-least-once bus it
/// schedules redelivery.
pub trait Acker: Send {
    /// The message was durably applied (or is a duplicate/echo).
    fn ack(self: Box<Self>);

    /// The message was rejected; redeliver later.
    fn nack(self: Box<Self>);
}

/// One delivered message.
pub struct BusMessage {
    /// Bus-assigned message id, stable across redeliveries
    pub id: String,
    /// Publish timestamp, stable across redeliveries
    pub publish_time: String,
    /// Payload bytes
    pub data: Vec<u8>,
    /// String attributes
    pub attributes: BTreeMap<String, String>,
    acker: Box<dyn Acker>,
}

impl BusMessage {
    /// Assemble a delivery from its parts and acknowledgement handle.
    pub fn new(
        id: String,
        publish_time: String,
        data: Vec<u8>,
        attributes: BTreeMap<String, String>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self { id, publish_time, data, attributes, acker }
    }

    /// Acknowledge this delivery.
    pub fn ack(self) {
        self.acker.ack();
    }

    /// Reject this delivery; the bus will redeliver it.
    pub fn nack(self) {
        self.acker.nack();
    }
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("id", &self.id)
            .field("publish_time", &self.publish_time)
            .field("data_len", &self.data.len())
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// A stream of deliveries for one topic.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Wrap a delivery channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { receiver }
    }

    /// Next delivery, or `None` when the subscription is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// The external publish/subscribe transport.
///
/// Duplicate delivery is expected and must be tolerated by consumers; the
/// bus may echo a publisher's own messages back to its subscriptions.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a payload with attributes; returns the bus-assigned id.
    async fn publish(
        &self,
        topic: &str,
        data: Vec<u8>,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, BusError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}
