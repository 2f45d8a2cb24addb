pub mod cooldown;
pub mod fingerprint;
pub mod generator;

pub use cooldown::{CooldownDecision, CooldownRecord, CooldownStore, CooldownTracker};
pub use cooldown::{InMemoryCooldownStore, RedisCooldownStore};
pub use fingerprint::{fingerprint, BehavioralSnapshot};
pub use generator::{GeneratedInsight, InsightGenerator};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The fixed set of insight categories.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InsightCategory {
    Communication,
    Personality,
    Behavioral,
    Emotional,
    Growth,
}

/// Outcome of an insight request at the service boundary.
///
/// `Fallback` is distinguishable from `Generated` so callers can tell a
/// canned degradation apart from genuine model output; `OnCooldown` carries
/// the remaining wait.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InsightResult {
    Generated {
        text: String,
        confidence: f64,
    },
    Fallback {
        text: String,
        confidence: f64,
    },
    OnCooldown {
        remaining_seconds: u64,
    },
}

impl InsightResult {
    pub fn is_on_cooldown(&self) -> bool {
        matches!(self, InsightResult::OnCooldown { .. })
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, InsightResult::Fallback { .. })
    }
}

/// Metrics for insight generation
#[derive(Debug, Default)]
pub struct InsightMetrics {
    pub generated: std::sync::atomic::AtomicU64,
    pub fallbacks: std::sync::atomic::AtomicU64,
    pub cooldown_blocks: std::sync::atomic::AtomicU64,
    pub forced: std::sync::atomic::AtomicU64,
}

impl InsightMetrics {
    pub fn record_generated(&self) {
        self.generated
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_cooldown_block(&self) {
        self.cooldown_blocks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_forced(&self) {
        self.forced
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_category_parsing() {
        assert_eq!(
            InsightCategory::from_str("communication"),
            Ok(InsightCategory::Communication)
        );
        assert_eq!(
            InsightCategory::from_str("growth"),
            Ok(InsightCategory::Growth)
        );
        assert!(InsightCategory::from_str("astrology").is_err());
    }

    #[test]
    fn test_result_predicates() {
        assert!(InsightResult::OnCooldown {
            remaining_seconds: 60
        }
        .is_on_cooldown());
        assert!(InsightResult::Fallback {
            text: "x".to_string(),
            confidence: 0.4
        }
        .is_fallback());
        assert!(!InsightResult::Generated {
            text: "x".to_string(),
            confidence: 0.85
        }
        .is_fallback());
    }
}
