//! In-process bus over a tokio broadcast channel.

use async_trait::async_trait;
use nimbus_core::BusEvent;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BusMessage, EventBus, Subscription, TopicPattern};
use crate::error::SyncResult;

#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        LocalBus { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn deliver(&self, msg: BusMessage) {
        // Err only means nobody is listening right now.
        if self.tx.send(msg).is_err() {
            trace!("Bus event published with no subscribers");
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, topic: &str, event: BusEvent) -> SyncResult<()> {
        self.deliver(BusMessage {
            topic: topic.to_string(),
            event,
        });
        Ok(())
    }

    fn subscribe(&self, pattern: TopicPattern) -> Subscription {
        Subscription::new(self.tx.subscribe(), pattern)
    }
}
