//! # Change Detector
//!
//! Compares two snapshots of the same scope and reports what changed.
//!
//! ## Algorithm
//! ```text
//!   previous            current
//!   ┌──────────┐        ┌──────────┐
//!   │ vpc-1 ●  │───────►│ vpc-1 ●  │   same state      → nothing
//!   │ vpc-2 ○  │───────►│ vpc-2 ●  │   state differs   → Updated
//!   │ vpc-3 ●  │        │          │   only previous   → Deleted
//!   │          │        │ vpc-4 ○  │   only current    → Created
//!   └──────────┘        └──────────┘
//! ```
//!
//! Output order is fixed: Created, then Deleted, then Updated, each sorted
//! by resource id. Events are stamped with the current snapshot's
//! observation time, so the same inputs always produce the same output.

use std::collections::BTreeMap;

use crate::event::{Change, ChangeEvent, ChangeKind};
use crate::types::{ResourceRecord, ResourceSnapshot};

/// Computes the change events between two snapshots of one scope.
///
/// Scope and kind of the produced events come from `current`. If a snapshot
/// lists the same id twice, the later record wins.
pub fn diff(previous: &ResourceSnapshot, current: &ResourceSnapshot) -> Vec<ChangeEvent> {
    let before = index(&previous.records);
    let after = index(&current.records);

    let event = |change: Change| {
        ChangeEvent::new(
            current.kind,
            current.scope.clone(),
            current.observed_at,
            change,
        )
    };

    let mut events = Vec::new();

    for (id, record) in &after {
        if !before.contains_key(id) {
            events.push(event(Change::Created {
                record: (*record).clone(),
            }));
        }
    }

    for (id, record) in &before {
        if !after.contains_key(id) {
            events.push(event(Change::Deleted {
                record: (*record).clone(),
            }));
        }
    }

    for (id, new) in &after {
        if let Some(old) = before.get(id) {
            if state_changed(old, new) {
                events.push(event(Change::Updated {
                    record: (*new).clone(),
                    old_state: old.state.clone(),
                    new_state: new.state.clone(),
                }));
            }
        }
    }

    events
}

fn index(records: &[ResourceRecord]) -> BTreeMap<&str, &ResourceRecord> {
    records.iter().map(|r| (r.id.as_str(), r)).collect()
}

/// Only the lifecycle state is change-relevant; names and attributes drift
/// on every provider call.
fn state_changed(old: &ResourceRecord, new: &ResourceRecord) -> bool {
    old.state != new.state
}

// =============================================================================
// Change Counts
// =============================================================================

/// Per-kind totals of a batch of change events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ChangeCounts {
    pub fn tally(events: &[ChangeEvent]) -> Self {
        let mut counts = ChangeCounts::default();
        for event in events {
            match event.kind() {
                ChangeKind::Created => counts.created += 1,
                ChangeKind::Updated => counts.updated += 1,
                ChangeKind::Deleted => counts.deleted += 1,
                ChangeKind::Listed => {}
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn add(&mut self, other: ChangeCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}
