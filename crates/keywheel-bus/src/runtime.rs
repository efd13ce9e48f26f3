//! Member runtime.
//!
//! Wires one member's [`Engine`] to the setup and update topics: one
//! supervised receive loop per topic, each invoking the engine
//! synchronously per delivered envelope. Attribute decoding happens before
//! the engine lock is taken; outbound publishes are dispatched after it is
//! released.

use std::sync::Arc;

use keywheel_core::{
    Engine, EngineError, EnvelopeAttributes, GroupRatchet, InboundEnvelope, engine::Disposition,
};
use tokio::sync::Mutex;

use crate::{
    bus::{BusError, BusMessage, MessageBus},
    supervisor::Supervisor,
};

/// Binds one member's engine to the bus.
///
/// The engine lock serializes all state transitions for this member across
/// both topic loops, as the protocol requires; the bus may still deliver
/// concurrently across topics.
pub struct MemberRuntime<R, B>
where
    R: GroupRatchet + Send + 'static,
    B: MessageBus,
{
    engine: Arc<Mutex<Engine<R>>>,
    bus: Arc<B>,
    supervisor: Supervisor,
}

impl<R, B> MemberRuntime<R, B>
where
    R: GroupRatchet + Send + 'static,
    R::State: Send,
    B: MessageBus,
{
    /// Bind `engine` to `bus`.
    pub fn new(engine: Engine<R>, bus: Arc<B>) -> Self {
        Self { engine: Arc::new(Mutex::new(engine)), bus, supervisor: Supervisor::default() }
    }

    /// Replace the default supervision policy.
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Shared handle to the engine (for inspection and tests).
    pub fn engine(&self) -> Arc<Mutex<Engine<R>>> {
        Arc::clone(&self.engine)
    }

    /// Run both receive loops until one exhausts its restart budget or the
    /// bus closes both subscriptions.
    pub async fn run(&self) -> Result<(), BusError> {
        let (setup_topic, update_topic) = {
            let engine = self.engine.lock().await;
            (engine.config().setup_topic.clone(), engine.config().update_topic.clone())
        };

        let setup_loop = self.supervisor.supervise(&setup_topic, || {
            Self::receive_loop(
                setup_topic.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.bus),
            )
        });
        let update_loop = self.supervisor.supervise(&update_topic, || {
            Self::receive_loop(
                update_topic.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.bus),
            )
        });

        tokio::try_join!(setup_loop, update_loop)?;
        Ok(())
    }

    /// One long-lived receive loop for one topic.
    ///
    /// A closed subscription is a transport failure: terminal to this loop,
    /// reported to the supervisor.
    async fn receive_loop(
        topic: String,
        engine: Arc<Mutex<Engine<R>>>,
        bus: Arc<B>,
    ) -> Result<(), BusError> {
        let mut subscription = bus.subscribe(&topic).await?;
        tracing::debug!(topic = %topic, "receive loop subscribed");

        while let Some(message) = subscription.next().await {
            Self::handle_message(&engine, &bus, message).await;
        }

        Err(BusError::SubscriptionClosed(topic))
    }

    /// Handle one delivery: decode, drive the engine under its lock, then
    /// ack/nack and publish after releasing it.
    async fn handle_message(engine: &Arc<Mutex<Engine<R>>>, bus: &Arc<B>, message: BusMessage) {
        tracing::debug!(
            id = %message.id,
            bytes = message.data.len(),
            "received bus message"
        );

        // Decode outside the engine lock
        let attributes = match EnvelopeAttributes::from_map(&message.attributes) {
            Ok(attributes) => attributes,
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "undecodable envelope, leaving for redelivery");
                message.nack();
                return;
            },
        };
        let envelope = InboundEnvelope {
            id: message.id.clone(),
            publish_time: message.publish_time.clone(),
            data: message.data.clone(),
            attributes,
        };

        let result = {
            let mut engine = engine.lock().await;
            engine.handle_envelope(&envelope)
        };

        match result {
            Ok(outcome) => {
                match outcome.disposition {
                    Disposition::Ack => message.ack(),
                    Disposition::Nack => message.nack(),
                }
                if let Some(publish) = outcome.publish {
                    let attributes = publish.attributes.to_map();
                    if let Err(e) = bus.publish(&publish.topic, publish.data, attributes).await {
                        tracing::error!(topic = %publish.topic, error = %e, "outbound publish failed");
                    }
                }
            },
            Err(e) => {
                log_rejection(&envelope.id, &e);
                message.nack();
            },
        }
    }
}

fn log_rejection(id: &str, error: &EngineError) {
    if error.is_violation() {
        tracing::warn!(id = %id, error = %error, "envelope rejected, leaving for redelivery");
    } else {
        tracing::error!(id = %id, error = %error, "persistence failure, leaving for redelivery");
    }
}
