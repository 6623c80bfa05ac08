//! Per-user ring of recently routed events, replayed when a client
//! reconnects with the id of the last event it saw.
//!
//! When a user's last connection closes, its subscriptions are parked for
//! the history TTL, so events published while the user is away are still
//! recorded for the reconnect.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use nimbus_core::BusEvent;
use tokio::time::Instant;

use super::connection::{HubFrame, Subscriptions};

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    at: Instant,
    name: String,
    data: serde_json::Value,
}

#[derive(Debug)]
pub(crate) struct EventHistory {
    capacity: usize,
    ttl: Duration,
    users: HashMap<String, VecDeque<Entry>>,
    away: HashMap<String, (Subscriptions, Instant)>,
}

impl EventHistory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        EventHistory {
            capacity,
            ttl,
            users: HashMap::new(),
            away: HashMap::new(),
        }
    }

    /// Appends an event for `user`. The same id is only stored once, so an
    /// event accepted by several of one user's connections is kept once.
    pub fn record(&mut self, user: &str, id: u64, name: &str, data: &serde_json::Value) {
        if self.capacity == 0 {
            return;
        }
        let entries = self.users.entry(user.to_string()).or_default();
        if entries.back().is_some_and(|last| last.id >= id) {
            return;
        }
        entries.push_back(Entry {
            id,
            at: Instant::now(),
            name: name.to_string(),
            data: data.clone(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Unexpired events for `user` with an id greater than `after`, oldest
    /// first.
    pub fn since(&self, user: &str, after: u64) -> Vec<HubFrame> {
        let Some(entries) = self.users.get(user) else {
            return Vec::new();
        };
        let now = Instant::now();
        entries
            .iter()
            .filter(|e| e.id > after && now.duration_since(e.at) <= self.ttl)
            .map(|e| HubFrame::Event {
                id: e.id,
                name: e.name.clone(),
                data: e.data.clone(),
            })
            .collect()
    }

    /// Keeps recording for `user` against `subscriptions` after its last
    /// connection closed.
    pub fn park(&mut self, user: &str, subscriptions: Subscriptions) {
        if self.capacity == 0 || subscriptions.is_empty() {
            return;
        }
        self.away
            .insert(user.to_string(), (subscriptions, Instant::now()));
    }

    /// Stops recording on behalf of a parked user.
    pub fn resume(&mut self, user: &str) {
        self.away.remove(user);
    }

    /// Parked users whose subscriptions accept the event.
    pub fn away_accepting(&self, event: &BusEvent, event_type: &str) -> Vec<String> {
        self.away
            .iter()
            .filter(|(_, (subs, _))| subs.accepts(event, event_type))
            .map(|(user, _)| user.clone())
            .collect()
    }

    /// Drops expired entries, users with nothing left and parked users
    /// away for longer than the TTL.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.away
            .retain(|_, (_, since)| now.duration_since(*since) <= ttl);
        self.users.retain(|_, entries| {
            while entries
                .front()
                .is_some_and(|e| now.duration_since(e.at) > ttl)
            {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }

    pub fn users(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SubscriptionTarget;
    use nimbus_core::SystemNotice;
    use serde_json::json;

    fn ids(frames: &[HubFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| match f {
                HubFrame::Event { id, .. } => Some(*id),
                HubFrame::Heartbeat => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_returns_newer_events_in_order() {
        let mut history = EventHistory::new(10, Duration::from_secs(3600));
        for id in [3, 5, 8] {
            history.record("user-1", id, "vpc-created", &json!({ "n": id }));
        }
        history.record("user-2", 9, "vpc-deleted", &json!({}));

        assert_eq!(ids(&history.since("user-1", 3)), vec![5, 8]);
        assert_eq!(ids(&history.since("user-1", 0)), vec![3, 5, 8]);
        assert!(history.since("user-1", 8).is_empty());
        assert!(history.since("nobody", 0).is_empty());

        match &history.since("user-2", 0)[0] {
            HubFrame::Event { name, .. } => assert_eq!(name, "vpc-deleted"),
            HubFrame::Heartbeat => panic!("unexpected heartbeat"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_recorded_once() {
        let mut history = EventHistory::new(10, Duration::from_secs(3600));
        history.record("user-1", 4, "system-alert", &json!({}));
        history.record("user-1", 4, "system-alert", &json!({}));
        assert_eq!(ids(&history.since("user-1", 0)), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_keeps_newest() {
        let mut history = EventHistory::new(3, Duration::from_secs(3600));
        for id in 1..=5 {
            history.record("user-1", id, "system-notification", &json!({}));
        }
        assert_eq!(ids(&history.since("user-1", 0)), vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_skipped_and_pruned() {
        let mut history = EventHistory::new(10, Duration::from_secs(60));
        history.record("user-1", 1, "system-notification", &json!({}));
        tokio::time::advance(Duration::from_secs(45)).await;
        history.record("user-1", 2, "system-notification", &json!({}));
        history.record("user-2", 3, "system-notification", &json!({}));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(ids(&history.since("user-1", 0)), vec![2]);

        history.prune();
        assert_eq!(history.users(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        history.prune();
        assert_eq!(history.users(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_subscriptions_expire() {
        let mut history = EventHistory::new(10, Duration::from_secs(60));
        let mut subs = Subscriptions::default();
        subs.add(SubscriptionTarget::EventType("system-alert".into()));
        history.park("user-1", subs);
        history.park("user-2", Subscriptions::default());

        let alert: BusEvent = SystemNotice::alert("disk").into();
        let notice: BusEvent = SystemNotice::notification("hi").into();
        assert_eq!(
            history.away_accepting(&alert, &alert.event_type()),
            vec!["user-1".to_string()]
        );
        assert!(history.away_accepting(&notice, &notice.event_type()).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        history.prune();
        assert!(history.away_accepting(&alert, &alert.event_type()).is_empty());
    }

    #[test]
    fn test_zero_capacity_disables_history() {
        let mut history = EventHistory::new(0, Duration::from_secs(60));
        history.record("user-1", 1, "system-alert", &json!({}));
        assert_eq!(history.users(), 0);
    }
}
