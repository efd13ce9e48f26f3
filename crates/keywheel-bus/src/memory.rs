//! In-memory message bus.
//!
//! In-process twin of the production bus for tests and simulation. Honors
//! the full delivery contract: at-least-once (nack schedules redelivery
//! after a short delay), no cross-subscriber ordering, and publishes are
//! echoed to every subscription on the topic including the publisher's
//! own. Clone is cheap (Arc); clones share the same topics.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{Acker, BusError, BusMessage, MessageBus, Subscription};

/// Delay before a nacked message is redelivered.
const REDELIVERY_DELAY: Duration = Duration::from_millis(20);

type Sender = mpsc::UnboundedSender<BusMessage>;

#[derive(Default)]
struct Topics {
    subscribers: HashMap<String, Vec<Sender>>,
}

/// Shared in-memory bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<Topics>>,
    sequence: Arc<AtomicU64>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Redelivers to one subscriber on nack.
struct MemoryAcker {
    id: String,
    publish_time: String,
    data: Vec<u8>,
    attributes: BTreeMap<String, String>,
    sender: Sender,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>) {
        // Redeliver to the same subscriber after a short delay, with the
        // same id and publish time, like a bus lease expiring.
        tokio::spawn(async move {
            tokio::time::sleep(REDELIVERY_DELAY).await;
            let sender = self.sender.clone();
            let redelivery = BusMessage::new(
                self.id.clone(),
                self.publish_time.clone(),
                self.data.clone(),
                self.attributes.clone(),
                self,
            );
            let _ = sender.send(redelivery);
        });
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        data: Vec<u8>,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, BusError> {
        let seq = self.next_sequence();
        let id = format!("m-{seq:08}");
        let publish_time = format!("t-{seq:08}");

        let subscribers = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics.subscribers.get(topic).cloned().unwrap_or_default()
        };

        for sender in subscribers {
            let message = BusMessage::new(
                id.clone(),
                publish_time.clone(),
                data.clone(),
                attributes.clone(),
                Box::new(MemoryAcker {
                    id: id.clone(),
                    publish_time: publish_time.clone(),
                    data: data.clone(),
                    attributes: attributes.clone(),
                    sender: sender.clone(),
                }),
            );
            // A dropped subscriber just misses the message
            let _ = sender.send(message);
        }

        Ok(id)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.subscribers.entry(topic.to_string()).or_default().push(sender);
        Ok(Subscription::new(receiver))
    }
}
