//! Cross-instance bus over Redis pub/sub.
//!
//! ```text
//! instance A                    Redis                     instance B
//! publish(vpc.created) ──► PUBLISH nimbus:events:vpc.created
//!                                 │
//!            ┌────────────────────┴────────────────────┐
//!   PSUBSCRIBE nimbus:events:*              PSUBSCRIBE nimbus:events:*
//!            ▼                                         ▼
//!       LocalBus ──► hub A                        LocalBus ──► hub B
//! ```
//!
//! Publishing never delivers locally; every instance, the publisher
//! included, receives its events back through the listener exactly once.
//! Neither side needs Redis to be up at start: the publisher connects on
//! first use and the listener keeps retrying with backoff.

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use nimbus_core::BusEvent;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusMessage, EventBus, LocalBus, Subscription, TopicPattern};
use crate::connector::RedisConnector;
use crate::error::{SyncError, SyncResult};

pub struct RedisBus {
    redis: RedisConnector,
    prefix: String,
    local: LocalBus,
}

impl RedisBus {
    /// Spawns the pub/sub listener; the publisher connects on first use.
    ///
    /// The listener reconnects with exponential backoff until `cancel`
    /// fires; its handle is returned so shutdown can await it.
    pub fn start(
        redis: RedisConnector,
        prefix: impl Into<String>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let prefix = prefix.into();
        let local = LocalBus::new(capacity);

        let listener = Listener {
            client: redis.client().clone(),
            pattern: format!("{}:*", prefix),
            local: local.clone(),
            cancel,
        };
        let handle = tokio::spawn(listener.run());

        let bus = RedisBus {
            redis,
            prefix,
            local,
        };
        (bus, handle)
    }

    fn channel(&self, topic: &str) -> String {
        channel_for(&self.prefix, topic)
    }
}

fn channel_for(prefix: &str, topic: &str) -> String {
    format!("{}:{}", prefix, topic)
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, topic: &str, event: BusEvent) -> SyncResult<()> {
        let envelope = BusMessage {
            topic: topic.to_string(),
            event,
        };
        let payload = serde_json::to_vec(&envelope)?;

        let mut conn = self
            .redis
            .connection()
            .await
            .map_err(|e| SyncError::Bus(e.to_string()))?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::Bus(e.to_string()))?;
        debug!(topic, receivers, "Published bus event");
        Ok(())
    }

    fn subscribe(&self, pattern: TopicPattern) -> Subscription {
        self.local.subscribe(pattern)
    }
}

// =============================================================================
// Listener
// =============================================================================

struct Listener {
    client: redis::Client,
    pattern: String,
    local: LocalBus,
    cancel: CancellationToken,
}

impl Listener {
    async fn run(self) {
        info!(pattern = %self.pattern, "Bus listener starting");
        let mut backoff = Self::create_backoff();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.listen(&mut backoff).await {
                Ok(()) => break,
                Err(e) => warn!(?e, "Bus listener disconnected"),
            }

            match backoff.next_backoff() {
                Some(duration) => {
                    debug!(?duration, "Waiting before bus reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                None => {
                    error!("Bus listener backoff exhausted");
                    break;
                }
            }
        }

        info!("Bus listener stopped");
    }

    /// Forwards messages until cancelled (`Ok`) or the connection drops.
    async fn listen(&self, backoff: &mut ExponentialBackoff) -> SyncResult<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| SyncError::Bus(e.to_string()))?;
        pubsub
            .psubscribe(&self.pattern)
            .await
            .map_err(|e| SyncError::Bus(e.to_string()))?;

        info!(pattern = %self.pattern, "Bus listener subscribed");
        backoff.reset();

        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Err(SyncError::Bus("pub/sub stream closed".into()));
                    };
                    self.forward(msg);
                }
            }
        }
    }

    fn forward(&self, msg: redis::Msg) {
        let payload: Vec<u8> = match msg.get_payload() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(channel = msg.get_channel_name(), ?e, "Unreadable bus payload");
                return;
            }
        };
        match serde_json::from_slice::<BusMessage>(&payload) {
            Ok(envelope) => self.local.deliver(envelope),
            Err(e) => warn!(channel = msg.get_channel_name(), ?e, "Dropping malformed bus envelope"),
        }
    }

    fn create_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::SystemNotice;

    #[test]
    fn test_channel_naming() {
        assert_eq!(channel_for("nimbus:events", "vpc.created"), "nimbus:events:vpc.created");
    }

    #[test]
    fn test_envelope_carries_topic() {
        let envelope = BusMessage {
            topic: "system.alert".into(),
            event: SystemNotice::alert("quota").into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, "system.alert");
        assert_eq!(back.event, envelope.event);
    }

    #[tokio::test]
    async fn test_starts_and_stops_without_redis() {
        let redis = RedisConnector::open("redis://127.0.0.1:1/").unwrap();
        let cancel = CancellationToken::new();
        let (bus, listener) = RedisBus::start(redis, "nimbus:events", 16, cancel.clone());

        let err = bus
            .publish("system.alert", SystemNotice::alert("x").into())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Bus(_)));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_backoff_never_gives_up() {
        let mut backoff = Listener::create_backoff();
        for _ in 0..50 {
            let next = backoff.next_backoff().unwrap();
            assert!(next <= Duration::from_secs(45));
        }
    }
}
