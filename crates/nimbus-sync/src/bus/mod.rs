//! # Event Bus
//!
//! Topic-addressed publish/subscribe between the scheduler and the fan-out
//! hub.
//!
//! ## Topics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  vpc.listed   vpc.created   vpc.updated   vpc.deleted                  │
//! │  subnet.*     cluster.*     instance.*                                 │
//! │  system.notification        system.alert                               │
//! │                                                                         │
//! │  Patterns match segment by segment; `*` matches one segment and a     │
//! │  bare `*` matches every topic.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`LocalBus`] delivers within one process. [`RedisBus`] carries events
//! across server instances over Redis pub/sub and hands them to a local bus
//! on each instance.

mod local;
mod redis;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

use std::fmt;

use async_trait::async_trait;
use nimbus_core::BusEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::SyncResult;

// =============================================================================
// Messages and Patterns
// =============================================================================

/// An event together with the topic it was published on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub event: BusEvent,
}

/// Dot-separated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<String>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Self {
        TopicPattern {
            segments: pattern.split('.').map(str::to_string).collect(),
        }
    }

    /// Pattern matching every topic.
    pub fn all() -> Self {
        Self::new(nimbus_core::WILDCARD)
    }

    pub fn is_all(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == nimbus_core::WILDCARD
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.is_all() {
            return true;
        }
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match parts.next() {
                Some(part) if segment == nimbus_core::WILDCARD || segment == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving side of a bus subscription.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    pattern: TopicPattern,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<BusMessage>, pattern: TopicPattern) -> Self {
        Subscription { rx, pattern }
    }

    /// Next message whose topic matches the pattern. Returns `None` once
    /// the bus is gone.
    ///
    /// A subscriber that falls behind loses the overwritten messages; the
    /// gap is logged and delivery resumes with the oldest retained one.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.pattern.matches(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, pattern = %self.pattern, "Bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }
}

// =============================================================================
// Event Bus
// =============================================================================

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes `event` on `topic`. Having no subscribers is not an error.
    async fn publish(&self, topic: &str, event: BusEvent) -> SyncResult<()>;

    /// Subscribes to every topic matching `pattern`.
    fn subscribe(&self, pattern: TopicPattern) -> Subscription;

    /// Publishes an event on its own topic.
    async fn publish_event(&self, event: BusEvent) -> SyncResult<()> {
        let topic = event.topic();
        self.publish(&topic, event).await
    }
}
