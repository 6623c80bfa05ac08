//! # nimbus-core: Pure Domain Logic for Nimbus Sync
//!
//! Types and pure functions shared by the sync engine, the fan-out hub and
//! the dashboard bindings. Nothing in this crate performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Nimbus Sync Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 nimbus-sync (engine crate)                       │   │
//! │  │  Scheduler ──► Cache ──► Bus ──► Fan-out Hub ──► SSE clients    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ nimbus-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   event   │  │   diff    │  │ priority  │  │   │
//! │  │   │ ScopeKey  │  │ChangeEvent│  │ Created   │  │ High      │  │   │
//! │  │   │ Snapshot  │  │ BusEvent  │  │ Updated   │  │ Medium    │  │   │
//! │  │   │ Record    │  │ Notice    │  │ Deleted   │  │ Low       │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO CACHE • NO NETWORK • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Scopes, resource records and snapshots
//! - [`event`] - Change events, system notices and bus envelopes
//! - [`diff`] - The change detector
//! - [`priority`] - Subscriber-count tiers
//! - [`keys`] - Cache/tracker key layout and per-kind TTLs
//! - [`regions`] - Supported providers and their default sweep regions
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use nimbus_core::{diff, ResourceKind, ResourceRecord, ResourceSnapshot, ScopeKey};
//!
//! let scope = ScopeKey::new("aws", "cred-a", "us-east-1");
//! let before = ResourceSnapshot::new(
//!     ResourceKind::Vpc,
//!     scope.clone(),
//!     vec![ResourceRecord::new("vpc-1", "main", "active", "us-east-1")],
//! );
//! let after = ResourceSnapshot::new(
//!     ResourceKind::Vpc,
//!     scope,
//!     vec![
//!         ResourceRecord::new("vpc-1", "main", "active", "us-east-1"),
//!         ResourceRecord::new("vpc-2", "edge", "pending", "us-east-1"),
//!     ],
//! );
//!
//! let events = diff(&before, &after);
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].topic(), "vpc.created");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod diff;
pub mod error;
pub mod event;
pub mod keys;
pub mod priority;
pub mod regions;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use diff::{diff, ChangeCounts};
pub use error::{CoreError, CoreResult};
pub use event::{BusEvent, Change, ChangeEvent, ChangeKind, NoticeLevel, SystemNotice};
pub use priority::{PriorityTier, TierThresholds};
pub use regions::RegionTable;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Event name of the acknowledgement every new real-time connection receives.
pub const CONNECTED_EVENT: &str = "connected";

/// Wildcard accepted in scope filters for credential and region.
pub const WILDCARD: &str = "*";
