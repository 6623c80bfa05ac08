//! # Priority Tiers
//!
//! Maps live subscriber counts to sync cadence.
//!
//! ```text
//!   subscribers:  0 ─────────── medium ─────────── high ──────────►
//!   tier:         Low            Medium             High
//!   default:      10 min sweep   3 min              1 min
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

/// Sync priority bucket. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
}

impl PriorityTier {
    /// Every tier, fastest first.
    pub const ALL: [PriorityTier; 3] = [PriorityTier::High, PriorityTier::Medium, PriorityTier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Low => "low",
            PriorityTier::Medium => "medium",
            PriorityTier::High => "high",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(PriorityTier::Low),
            "medium" => Ok(PriorityTier::Medium),
            "high" => Ok(PriorityTier::High),
            other => Err(format!("Unknown priority tier: '{}'", other)),
        }
    }
}

/// Subscriber-count thresholds separating the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Counts at or above this are High.
    pub high: u64,
    /// Counts at or above this (and below `high`) are Medium.
    pub medium: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        TierThresholds { high: 5, medium: 1 }
    }
}

impl TierThresholds {
    /// Creates validated thresholds.
    pub fn new(high: u64, medium: u64) -> Result<Self, CoreError> {
        let thresholds = TierThresholds { high, medium };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Every tier must be reachable and zero subscribers must stay Low.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.medium == 0 || self.high <= self.medium {
            return Err(CoreError::InvalidThresholds {
                high: self.high,
                medium: self.medium,
            });
        }
        Ok(())
    }

    /// Derives the tier for a subscriber count.
    pub fn tier(&self, count: u64) -> PriorityTier {
        if count >= self.high {
            PriorityTier::High
        } else if count >= self.medium {
            PriorityTier::Medium
        } else {
            PriorityTier::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let t = TierThresholds::default();
        assert_eq!(t.tier(0), PriorityTier::Low);
        assert_eq!(t.tier(1), PriorityTier::Medium);
        assert_eq!(t.tier(4), PriorityTier::Medium);
        assert_eq!(t.tier(5), PriorityTier::High);
        assert_eq!(t.tier(500), PriorityTier::High);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(PriorityTier::Low < PriorityTier::Medium);
        assert!(PriorityTier::Medium < PriorityTier::High);
    }

    #[test]
    fn test_tier_is_monotonic_in_count() {
        let t = TierThresholds::new(8, 3).unwrap();
        for c2 in 0..40u64 {
            for c1 in 0..c2 {
                assert!(t.tier(c1) <= t.tier(c2), "tier({}) > tier({})", c1, c2);
            }
        }
    }

    #[test]
    fn test_invalid_thresholds() {
        assert!(TierThresholds::new(5, 0).is_err());
        assert!(TierThresholds::new(3, 3).is_err());
        assert!(TierThresholds::new(2, 4).is_err());
        assert!(TierThresholds::new(2, 1).is_ok());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("HIGH".parse::<PriorityTier>().unwrap(), PriorityTier::High);
        assert!("urgent".parse::<PriorityTier>().is_err());
    }
}
